//! Block graphs
//!
//! An automation program is a graph of [`BlockNode`] chains owned by one
//! [`OwnerId`](hr_core::OwnerId). Hat blocks suspend on locks from the
//! shared [`LockManager`](hr_locks::LockManager) and run their children
//! whenever a condition holds or a broadcast key fires. Releasing the graph
//! releases the owner, which wakes every waiting hat and ends every loop.
//!
//! # Example
//!
//! ```ignore
//! let locks = Arc::new(LockManager::new());
//! let graph = BlockGraph::new(
//!     "porch-lights",
//!     locks.clone(),
//!     vec![BlockNode::when_event("on-dusk", "dusk")
//!         .with_child(BlockNode::broadcast("lights-on", "porch_light", Some(json!(true))))],
//! );
//! graph.start().await?;
//! ```

pub mod block;
pub mod context;
pub mod error;
pub mod graph;

pub use block::{BlockKind, BlockNode, CommandFn, Predicate, ValueFn};
pub use context::{BlockContext, INDEX_VAR, VALUE_VAR};
pub use error::{BlockError, BlockResult};
pub use graph::{
    handle_and_release, run_chain, BlockGraph, Flow, GraphHandle, MAX_WAIT, MIN_LOOP_PAUSE,
    MIN_WAIT,
};
