pub mod rwlatch;
pub mod types;
