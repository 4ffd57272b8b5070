pub mod config;
pub mod retrieval;
