//! # hy-store
//!
//! The storage collaborator of the control loop: experiments, trials and
//! their observation logs. [`Store`] is the interface the controller and the
//! metrics path talk to; [`MemoryStore`] is the in-process implementation.

mod memory;
mod store;

pub use memory::{MemoryStore, StoreStats};
#[cfg(any(test, feature = "test-util"))]
pub use memory::StoreOp;
pub use store::Store;
