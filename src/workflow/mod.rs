pub mod batch;
pub mod prompt;
pub mod report;
