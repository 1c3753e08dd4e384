pub mod aggregator;
pub mod app;
pub mod arr;
pub mod config;
pub mod matcher;
pub mod models;
pub mod notify;
pub mod pool;
pub mod scan;
pub mod state;
