//! nearchat-node library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod console;
pub mod infrastructure;
pub mod node;

pub use node::ChatNode;
