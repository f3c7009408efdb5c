pub mod hello;
pub mod options;
pub mod orchestrator;
pub mod probe;
pub mod scheduler;
