//! # CouponSnipe Clock
//!
//! Local-to-reference clock alignment. Flash-sale endpoints open at a server
//! instant, not a client instant; this crate estimates the offset between the
//! local clock and an external reference (with half-round-trip delay
//! compensation) and provides a precision wait that fires within a few
//! milliseconds of a target reference time.
//!
//! The offset lives only in memory. It is recomputed on every process start
//! and degrades to the local clock (offset 0) until the first sync succeeds.

pub mod source;
pub mod sync;
pub mod wait;

pub use source::{TimeShape, TimeSource, builtin_sources};
pub use sync::{Clock, DelayStats, SyncStatus};
