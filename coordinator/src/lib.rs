pub mod artifacts;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod handlers;
pub mod jobs;
pub mod persist;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::CoordinatorConfig;
pub use handlers::build_router;
pub use state::AppState;
