//! Block nodes
//!
//! A [`BlockNode`] is one block of an automation program. Nodes form chains
//! through `next`; hat and control blocks own nested sub-chains in
//! `children`, which run in order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hr_core::Value;
use hr_locks::ConditionFn;

use crate::context::BlockContext;

/// User handler of a command block
pub type CommandFn = Arc<dyn Fn(&mut BlockContext) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Condition evaluated against the running chain's context
pub type Predicate = Arc<dyn Fn(&BlockContext) -> bool + Send + Sync + 'static>;

/// Sampled value watched by a value-changed hat
pub type ValueFn = Arc<dyn Fn() -> Value + Send + Sync + 'static>;

/// What a block does when handled
#[derive(Clone)]
pub enum BlockKind {
    /// Run a user handler
    Command(CommandFn),

    /// Hat: run children on every poller tick the condition holds
    WhenCondition(ConditionFn),

    /// Hat: run children whenever the condition flips
    WhenConditionChanged(ConditionFn),

    /// Hat: run children whenever the sampled value changes
    WhenValueChanged(ValueFn),

    /// Hat: run children whenever the broadcast key fires
    WhenEvent { key: String },

    /// Fire a broadcast event
    Broadcast { key: String, value: Option<Value> },

    /// Suspend the chain until the condition holds once
    WaitUntil(ConditionFn),

    /// Suspend the chain for a fixed time between one second and one hour
    Wait(Duration),

    /// Run children a fixed number of times
    Repeat { times: u32 },

    /// Run children until the graph is released
    Forever,

    /// Run children at a fixed interval until the graph is released
    Schedule { every: Duration },

    /// Run children if the condition holds, otherwise the else branch
    If {
        condition: Predicate,
        else_branch: Vec<BlockNode>,
    },

    /// Release the whole graph
    Stop,
}

impl BlockKind {
    /// Short block name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Command(_) => "command",
            BlockKind::WhenCondition(_) => "when_condition",
            BlockKind::WhenConditionChanged(_) => "when_condition_changed",
            BlockKind::WhenValueChanged(_) => "when_value_changed",
            BlockKind::WhenEvent { .. } => "when_event",
            BlockKind::Broadcast { .. } => "broadcast",
            BlockKind::WaitUntil(_) => "wait_until",
            BlockKind::Wait(_) => "wait",
            BlockKind::Repeat { .. } => "repeat",
            BlockKind::Forever => "forever",
            BlockKind::Schedule { .. } => "schedule",
            BlockKind::If { .. } => "if",
            BlockKind::Stop => "stop",
        }
    }

    /// Whether the block waits for a condition and never continues to `next`
    pub fn is_hat(&self) -> bool {
        matches!(
            self,
            BlockKind::WhenCondition(_)
                | BlockKind::WhenConditionChanged(_)
                | BlockKind::WhenValueChanged(_)
                | BlockKind::WhenEvent { .. }
        )
    }
}

impl fmt::Debug for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::WhenEvent { key } => f.debug_struct("WhenEvent").field("key", key).finish(),
            BlockKind::Broadcast { key, value } => f
                .debug_struct("Broadcast")
                .field("key", key)
                .field("value", value)
                .finish(),
            BlockKind::Wait(duration) => f.debug_tuple("Wait").field(duration).finish(),
            BlockKind::Repeat { times } => f.debug_struct("Repeat").field("times", times).finish(),
            BlockKind::Schedule { every } => {
                f.debug_struct("Schedule").field("every", every).finish()
            }
            BlockKind::If { else_branch, .. } => f
                .debug_struct("If")
                .field("else_branch", else_branch)
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

/// One block of an automation program
#[derive(Debug, Clone)]
pub struct BlockNode {
    /// Unique block id; also the watch id of polled hats
    pub id: String,
    /// Block behavior
    pub kind: BlockKind,
    /// Next block of the chain
    pub next: Option<Box<BlockNode>>,
    /// Nested sub-chains of hat and control blocks
    pub children: Vec<BlockNode>,
}

impl BlockNode {
    /// Create a block without next or children
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            children: Vec::new(),
        }
    }

    pub fn command<F>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut BlockContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(id, BlockKind::Command(Arc::new(handler)))
    }

    pub fn when_condition<F>(id: impl Into<String>, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::new(id, BlockKind::WhenCondition(Arc::new(condition)))
    }

    pub fn when_condition_changed<F>(id: impl Into<String>, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::new(id, BlockKind::WhenConditionChanged(Arc::new(condition)))
    }

    pub fn when_value_changed<F>(id: impl Into<String>, value: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::new(id, BlockKind::WhenValueChanged(Arc::new(value)))
    }

    pub fn when_event(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(id, BlockKind::WhenEvent { key: key.into() })
    }

    pub fn broadcast(id: impl Into<String>, key: impl Into<String>, value: Option<Value>) -> Self {
        Self::new(
            id,
            BlockKind::Broadcast {
                key: key.into(),
                value,
            },
        )
    }

    pub fn wait_until<F>(id: impl Into<String>, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::new(id, BlockKind::WaitUntil(Arc::new(condition)))
    }

    pub fn wait(id: impl Into<String>, duration: Duration) -> Self {
        Self::new(id, BlockKind::Wait(duration))
    }

    pub fn repeat(id: impl Into<String>, times: u32) -> Self {
        Self::new(id, BlockKind::Repeat { times })
    }

    pub fn forever(id: impl Into<String>) -> Self {
        Self::new(id, BlockKind::Forever)
    }

    pub fn schedule(id: impl Into<String>, every: Duration) -> Self {
        Self::new(id, BlockKind::Schedule { every })
    }

    pub fn if_then<F>(id: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&BlockContext) -> bool + Send + Sync + 'static,
    {
        Self::new(
            id,
            BlockKind::If {
                condition: Arc::new(condition),
                else_branch: Vec::new(),
            },
        )
    }

    pub fn stop(id: impl Into<String>) -> Self {
        Self::new(id, BlockKind::Stop)
    }

    /// Add a nested sub-chain
    pub fn with_child(mut self, child: BlockNode) -> Self {
        self.children.push(child);
        self
    }

    /// Add a sub-chain to the else branch of an `If` block
    ///
    /// Ignored for any other block kind.
    pub fn with_else(mut self, branch: BlockNode) -> Self {
        if let BlockKind::If { else_branch, .. } = &mut self.kind {
            else_branch.push(branch);
        }
        self
    }

    /// Append `next` at the end of this chain
    pub fn then(mut self, next: BlockNode) -> Self {
        let mut tail = &mut self;
        while tail.next.is_some() {
            // Checked just above
            tail = tail.next.as_deref_mut().unwrap();
        }
        tail.next = Some(Box::new(next));
        self
    }

    /// Whether this block is a hat
    pub fn is_hat(&self) -> bool {
        self.kind.is_hat()
    }

    /// Number of blocks in the chain starting here
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut node = self.next.as_deref();
        while let Some(n) = node {
            len += 1;
            node = n.next.as_deref();
        }
        len
    }
}
