//! # CouponSnipe Core
//!
//! Shared foundation for the CouponSnipe workspace: the error taxonomy and
//! the settings file. Everything else (clock, engine) builds on this crate.

pub mod config;
pub mod error;

pub use config::Settings;
pub use error::{DispatchError, Result, SnipeError};
