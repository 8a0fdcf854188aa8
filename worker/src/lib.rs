pub mod agent;
pub mod artifacts;
pub mod config;
pub mod coordinator_client;
pub mod engine;
pub mod handlers;
pub mod partitions;
pub mod process;
pub mod worker;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use config::WorkerConfig;
pub use coordinator_client::{CoordinatorApi, HeartbeatStatus, HttpCoordinator};
pub use engine::Engine;
