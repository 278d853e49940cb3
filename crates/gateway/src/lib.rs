//! Text-to-SQL gateway: turns questions into validated read-only queries and
//! runs them only after the caller approves.

pub mod catalog;
pub mod config;
pub mod executor;
pub mod format;
pub mod http;
pub mod metrics;
pub mod permissions;
pub mod pipeline;
pub mod rate_limit;
pub mod sessions;
