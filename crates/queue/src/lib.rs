pub mod envelope;
pub mod memory_store;
pub mod redis_store;
pub mod store;
