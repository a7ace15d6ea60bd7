//! # CouponSnipe Engine
//!
//! The scheduling-and-retry execution core: single-request tasks fired at a
//! precise reference-clock instant, retried under a bounded attempt budget,
//! and classified against per-site success/stop rules.
//!
//! ## Architecture
//! ```text
//! SnipeService (command surface)
//!   ├── TaskScheduler: fireTime = executeAt − advanceMs
//!   │     ├── delay ≤ 0            → retry loop now
//!   │     ├── delay ≤ TIMER_MAX    → tokio timer + precision wait
//!   │     └── delay > TIMER_MAX    → durable alarm record (re-armed on restore)
//!   ├── RetryController: attempt loop, backoff, first-success-wins
//!   │     ├── ExecutionDispatcher: signed request, optional hedged paths
//!   │     └── ResponseClassifier: success | stop | continue
//!   └── KvStore: task map persisted after every status/stats mutation
//! ```
//!
//! One spawned tokio task per scheduled run; tasks are independent async
//! control flows touching disjoint map entries. Cancellation is cooperative:
//! checked at timer fire and at the top of every retry iteration.

pub mod dispatch;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod service;
pub mod signer;
pub mod store;
pub mod task;

pub use dispatch::{Dispatch, HttpDispatcher, ResponseRecord};
pub use retry::{RetryController, RunOutcome};
pub use rules::{Verdict, classify};
pub use scheduler::{TIMER_MAX_MS, TaskScheduler};
pub use service::{LogEntry, NewTask, Snapshot, SnipeService};
pub use signer::{FingerprintSigner, SignerRegistry, SiteSigner};
pub use store::{FileStore, KvStore, MemoryStore};
pub use task::{
    BackoffMode, ExecutionPolicy, RequestSpec, Rule, RuleSet, Schedule, SharedTasks, Task,
    TaskStats, TaskStatus,
};
