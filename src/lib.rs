pub mod access;
pub mod browser;
pub mod cli;
pub mod config;
pub mod fsutil;
pub mod http;
pub mod server;
pub mod thread_pool;
