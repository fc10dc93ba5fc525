pub mod broker;
pub mod config;
pub mod database;
pub mod pipeline;
pub mod pool;
pub mod validation;
