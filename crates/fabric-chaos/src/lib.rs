pub mod engine;
pub mod schedule;
pub mod sink;

pub use engine::ChaosEngine;
pub use schedule::{compile_schedule, ChaosAction, ScheduledEvent};
pub use sink::OverridesSink;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("scenario '{0}' not found in topology")]
    UnknownScenario(String),
    #[error(transparent)]
    Io(#[from] fabric_io::IoError),
}
