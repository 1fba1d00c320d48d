pub mod registry;
pub mod sink;
