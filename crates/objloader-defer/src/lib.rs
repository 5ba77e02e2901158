//! Dependency gating for streamed object graphs.
//!
//! Resolved Items enter the [`DefermentManager`], which releases each one
//! only after every id in its closure was released, and fails whole
//! ancestor chains when a dependency can never arrive.

pub mod error;
pub mod manager;

pub use error::{DeferError, DeferResult};
pub use manager::{Advance, DefermentConfig, DefermentManager};
