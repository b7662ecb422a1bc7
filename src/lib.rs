pub mod app;
pub mod config;
pub mod ipc;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod security;
pub mod shared;
pub mod worker;
