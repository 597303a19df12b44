#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drover-pool
//!
//! Worker pool for the drover engine.
//!
//! String keys are pushed onto one rate-limiting delay queue and handled by
//! N tokio workers. Each key is routed to the [`Action`] registered under an
//! exact key or a glob pattern, and the returned [`Status`] decides whether
//! and when the key comes back.

pub mod action;
pub mod pool;
pub mod queue;
pub mod status;

pub use action::{Action, ActionRegistry, Matcher};
pub use pool::{
    COMMAND_PREFIX, OBJECT_PREFIX, Pool, PoolConfig, TICK_COMMAND, command_key, object_key,
};
pub use queue::{WorkQueue, calculate_backoff};
pub use status::{Requeue, Status, requeue_for};
