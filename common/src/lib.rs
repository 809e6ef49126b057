// Periodic job queue: scheduler core, job stores, wire protocol and sessions

pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;
pub mod telemetry;

pub use client::Client;
pub use scheduler::Sched;
pub use server::Server;
