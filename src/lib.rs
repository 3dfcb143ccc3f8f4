pub mod agent;
pub mod config;
pub mod error;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod workflow;
pub mod workspace;
