//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{message, TestEnv};
//!
//! #[tokio::test]
//! async fn test_single_message() {
//!     let env = TestEnv::new();
//!     let worker = env.worker(3);
//!
//!     worker.submit(&message("m1")).await;
//!     worker.drain().await;
//! }
//! ```

mod constants;
mod doubles;
mod worker;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use doubles::{FlakyQueue, FlakyStore};
pub use worker::{message, TestEnv, TestWorker};
