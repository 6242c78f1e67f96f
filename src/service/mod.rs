pub mod engine;
pub mod sink;

pub use engine::{EngineEvent, EngineHandle, TransferService};
pub use sink::log_commands;
