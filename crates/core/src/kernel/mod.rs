//! Delta Kernel module
//!
//! Log actions, table schema and the snapshot replayed from them.

pub mod models;
pub mod snapshot;

pub use models::*;
pub use snapshot::*;
