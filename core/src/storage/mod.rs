mod memory;
mod store_trait;

pub use memory::MemoryStore;
pub use store_trait::{CausalityStore, PersistedEdge};
