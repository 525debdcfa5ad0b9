//! PipelineStore implementations.

mod memory;
mod store;

pub use memory::MemoryStore;
pub use store::PgStore;
