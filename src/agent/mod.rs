pub mod locate;
pub mod runner;

pub use locate::AgentLocator;
pub use runner::{AgentRunner, UnitRunner};
