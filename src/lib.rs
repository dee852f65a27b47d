pub mod cli;
pub mod config;
pub mod demo;
pub mod engine;
pub mod executor;
pub mod util;

pub use config::Settings;
pub use engine::{
    Args, BoundArgs, CallId, Context, Conversation, DefinitionError, EngineError, Interrupt,
    Message, Program, Schema, ScopeId, Step, StepDefinition, StepHooks, Structural,
};
pub use executor::{
    ContinuousExecutor, ResultCache, StepExecutor, TurnOutcome, TurnRecord, TurnState,
};
