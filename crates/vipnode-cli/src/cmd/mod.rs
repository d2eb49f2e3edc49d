pub mod agent;
pub mod pool;
