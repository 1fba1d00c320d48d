pub mod backoff;
pub mod producer;
pub mod worker;
