//! Block graph executor
//!
//! Each root chain runs on its own task. Blocks of a chain run in order;
//! hat blocks suspend on a lock and run their children on every wake-up
//! until the graph is released. A failing block aborts only the current
//! invocation of its chain.
//!
//! Two live graphs must not share an owner; a replacement starts only after
//! the previous graph has [finished](GraphHandle::finished).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hr_core::{OwnerId, Value};
use hr_locks::{Lock, SharedLockManager};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block::{BlockKind, BlockNode};
use crate::context::{BlockContext, INDEX_VAR, VALUE_VAR};
use crate::error::{BlockError, BlockResult};

/// Minimum pause between two iterations of a loop block
pub const MIN_LOOP_PAUSE: Duration = Duration::from_millis(100);

/// Shortest accepted `Wait` duration
pub const MIN_WAIT: Duration = Duration::from_secs(1);

/// Longest accepted `Wait` duration
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The chain ran to its end
    Continue,
    /// The graph was released; nothing more runs
    Released,
}

/// Runs `on_release` exactly once when dropped
struct ReleaseGuard<R: FnOnce()> {
    on_release: Option<R>,
}

impl<R: FnOnce()> Drop for ReleaseGuard<R> {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

/// Run `setup` and guarantee `on_release` runs exactly once afterwards
///
/// `on_release` runs whether `setup` completes, fails, panics or the
/// returned future is dropped before completion.
pub async fn handle_and_release<S, Fut, R>(setup: S, on_release: R) -> BlockResult<()>
where
    S: FnOnce() -> Fut,
    Fut: Future<Output = BlockResult<()>>,
    R: FnOnce(),
{
    let _guard = ReleaseGuard {
        on_release: Some(on_release),
    };
    setup().await
}

/// Releases a running graph from outside
#[derive(Debug, Clone)]
pub struct GraphHandle {
    owner: OwnerId,
    locks: SharedLockManager,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl GraphHandle {
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Release the graph: waiting hats wake with false and loops end
    ///
    /// Returns false if the graph was already released.
    pub fn release(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        self.locks.release(&self.owner);
        true
    }

    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether every chain has ended and the owner scope was cleared
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the graph has finished
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Release and clear the owner scope once no chain can touch it again
    ///
    /// A chain racing the release may have re-created the owner's context;
    /// clearing it again here drops that context and its poller.
    fn finish(&self) {
        if self.finished.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.locks.release(&self.owner);
        self.finished.cancel();
    }
}

/// A program of block chains scoped to one owner
pub struct BlockGraph {
    roots: Vec<Arc<BlockNode>>,
    handle: GraphHandle,
}

impl BlockGraph {
    /// Create a graph; `owner` scopes every lock its blocks create
    pub fn new(owner: impl Into<OwnerId>, locks: SharedLockManager, roots: Vec<BlockNode>) -> Self {
        Self {
            roots: roots.into_iter().map(Arc::new).collect(),
            handle: GraphHandle {
                owner: owner.into(),
                locks,
                cancel: CancellationToken::new(),
                finished: CancellationToken::new(),
            },
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.handle.owner
    }

    pub fn roots(&self) -> &[Arc<BlockNode>] {
        &self.roots
    }

    /// Handle for releasing the graph while `start` is running
    pub fn handle(&self) -> GraphHandle {
        self.handle.clone()
    }

    pub fn release(&self) -> bool {
        self.handle.release()
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    fn context(&self) -> BlockContext {
        BlockContext::new(
            self.handle.owner.clone(),
            self.handle.locks.clone(),
            self.handle.cancel.clone(),
        )
    }

    /// Run every root chain on its own task until all end or the graph is released
    ///
    /// The owner is released when this returns. On release every chain task
    /// is aborted at its next await point and awaited before the owner scope
    /// is cleared.
    pub async fn start(&self) -> BlockResult<()> {
        let handle = self.handle.clone();
        handle_and_release(
            move || self.run_roots(),
            move || {
                handle.finish();
                info!(owner = %handle.owner, "Block graph released");
            },
        )
        .await
    }

    async fn run_roots(&self) -> BlockResult<()> {
        if self.is_released() {
            return Ok(());
        }

        let owner = self.owner().clone();
        // Dropping the set aborts every chain still running
        let mut tasks = JoinSet::new();
        for root in &self.roots {
            let root = root.clone();
            let mut ctx = self.context();
            tasks.spawn(async move {
                if let Err(e) = run_chain(&root, &mut ctx).await {
                    warn!(owner = %ctx.owner(), block = %root.id, error = %e, "Chain aborted");
                }
            });
        }
        info!(owner = %owner, chains = tasks.len(), "Block graph started");

        tokio::select! {
            _ = async {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(owner = %owner, error = %e, "Chain task panicked");
                    }
                }
            } => {}
            _ = self.handle.cancel.cancelled() => {
                debug!(owner = %owner, "Block graph released while running");
            }
        }
        tasks.shutdown().await;
        Ok(())
    }
}

impl Drop for BlockGraph {
    fn drop(&mut self) {
        self.handle.finish();
    }
}

impl std::fmt::Debug for BlockGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockGraph")
            .field("owner", &self.handle.owner)
            .field("roots", &self.roots.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Run a chain starting at `head`; hats never continue to `next`
pub fn run_chain<'a>(head: &'a BlockNode, ctx: &'a mut BlockContext) -> BoxFuture<'a, BlockResult<Flow>> {
    Box::pin(async move {
        let mut node = Some(head);
        while let Some(current) = node {
            if ctx.is_released() {
                return Ok(Flow::Released);
            }
            if run_block(current, ctx).await? == Flow::Released {
                return Ok(Flow::Released);
            }
            node = if current.is_hat() {
                None
            } else {
                current.next.as_deref()
            };
        }
        Ok(Flow::Continue)
    })
}

async fn run_children(children: &[BlockNode], ctx: &mut BlockContext) -> BlockResult<Flow> {
    for child in children {
        if run_chain(child, ctx).await? == Flow::Released {
            return Ok(Flow::Released);
        }
    }
    Ok(Flow::Continue)
}

async fn run_block(node: &BlockNode, ctx: &mut BlockContext) -> BlockResult<Flow> {
    debug!(owner = %ctx.owner(), block = %node.id, kind = node.kind.name(), "Handling block");

    match &node.kind {
        BlockKind::Command(handler) => {
            handler(ctx).map_err(|e| BlockError::Handler {
                block: node.id.clone(),
                message: e.to_string(),
            })?;
            Ok(Flow::Continue)
        }

        BlockKind::WhenCondition(condition) => {
            let condition = condition.clone();
            let lock = ctx
                .lock_manager()
                .listen_event(ctx.owner(), &node.id, move || condition())?;
            run_hat(node, ctx, lock).await
        }

        BlockKind::WhenConditionChanged(condition) => {
            // 0 = no sample yet, 1 = false, 2 = true
            let condition = condition.clone();
            let last = AtomicU8::new(0);
            let lock = ctx.lock_manager().listen_event(ctx.owner(), &node.id, move || {
                let now = if condition() { 2 } else { 1 };
                let previous = last.swap(now, Ordering::SeqCst);
                previous != 0 && previous != now
            })?;
            run_hat(node, ctx, lock).await
        }

        BlockKind::WhenValueChanged(sample) => {
            let sample = sample.clone();
            let last: Mutex<Option<Value>> = Mutex::new(None);
            let lock = ctx.lock_manager().listen_event(ctx.owner(), &node.id, move || {
                let now = sample();
                let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
                let changed = matches!(last.as_ref(), Some(previous) if *previous != now);
                *last = Some(now);
                changed
            })?;
            run_hat(node, ctx, lock).await
        }

        BlockKind::WhenEvent { key } => {
            let lock = ctx.lock_manager().get_or_create_lock(ctx.owner(), key);
            run_hat(node, ctx, lock).await
        }

        BlockKind::Broadcast { key, value } => {
            let fired = ctx.fire_event(key, value.clone())?;
            debug!(owner = %ctx.owner(), block = %node.id, key = %key, fired, "Broadcast");
            Ok(Flow::Continue)
        }

        BlockKind::WaitUntil(condition) => {
            let condition = condition.clone();
            let lock = ctx
                .lock_manager()
                .listen_event(ctx.owner(), &node.id, move || condition())?;
            let woke = ctx.wait_on(&lock).await;
            ctx.lock_manager().remove_listener(ctx.owner(), &node.id);
            Ok(if woke && !ctx.is_released() {
                Flow::Continue
            } else {
                Flow::Released
            })
        }

        BlockKind::Wait(duration) => {
            if *duration < MIN_WAIT || *duration > MAX_WAIT {
                return Err(BlockError::InvalidBlock {
                    block: node.id.clone(),
                    reason: format!(
                        "wait must be between {}s and {}s, got {:?}",
                        MIN_WAIT.as_secs(),
                        MAX_WAIT.as_secs(),
                        duration
                    ),
                });
            }
            Ok(if ctx.pause(*duration).await {
                Flow::Continue
            } else {
                Flow::Released
            })
        }

        BlockKind::Repeat { times } => {
            for i in 0..*times {
                ctx.set_var(INDEX_VAR, json!(i));
                if run_children(&node.children, ctx).await? == Flow::Released {
                    return Ok(Flow::Released);
                }
                if i + 1 < *times && !ctx.pause(MIN_LOOP_PAUSE).await {
                    return Ok(Flow::Released);
                }
            }
            Ok(Flow::Continue)
        }

        BlockKind::Forever => {
            let mut i: u64 = 0;
            loop {
                ctx.set_var(INDEX_VAR, json!(i));
                if run_children(&node.children, ctx).await? == Flow::Released
                    || !ctx.pause(MIN_LOOP_PAUSE).await
                {
                    return Ok(Flow::Released);
                }
                i += 1;
            }
        }

        BlockKind::Schedule { every } => {
            let every = (*every).max(MIN_LOOP_PAUSE);
            let mut i: u64 = 0;
            loop {
                ctx.set_var(INDEX_VAR, json!(i));
                if run_children(&node.children, ctx).await? == Flow::Released
                    || !ctx.pause(every).await
                {
                    return Ok(Flow::Released);
                }
                i += 1;
            }
        }

        BlockKind::If {
            condition,
            else_branch,
        } => {
            if condition(&*ctx) {
                run_children(&node.children, ctx).await
            } else {
                run_children(else_branch, ctx).await
            }
        }

        BlockKind::Stop => {
            info!(owner = %ctx.owner(), block = %node.id, "Stop block releasing graph");
            ctx.release();
            Ok(Flow::Released)
        }
    }
}

/// Wait on `lock` and run the hat's children on every wake-up
async fn run_hat(node: &BlockNode, ctx: &mut BlockContext, lock: Arc<Lock>) -> BlockResult<Flow> {
    debug!(owner = %ctx.owner(), block = %node.id, key = lock.key(), "Hat waiting");

    while ctx.wait_on(&lock).await {
        let mut invocation = ctx.clone();
        if let Some(value) = lock.last_value() {
            invocation.set_var(VALUE_VAR, value);
        }

        match run_children(&node.children, &mut invocation).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Released) => break,
            Err(e) => {
                warn!(owner = %ctx.owner(), block = %node.id, error = %e, "Hat invocation failed");
            }
        }
    }

    debug!(owner = %ctx.owner(), block = %node.id, "Hat released");
    Ok(Flow::Released)
}
