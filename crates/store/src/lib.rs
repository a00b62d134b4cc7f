//! Run and conversation stores for runloop.

pub mod in_memory;

pub use in_memory::InMemoryRunStore;
