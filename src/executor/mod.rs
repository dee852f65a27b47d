//! Drivers that run a [`Program`](crate::engine::Program) as a conversation.

pub mod continuous;
pub mod record;
pub mod step_executor;

pub use continuous::{ContinuousExecutor, TurnState};
pub use record::{ResultCache, TurnRecord};
pub use step_executor::{StepExecutor, TurnOutcome};
