//! Replay engine: call numbering, structural codec, steps and programs.

pub mod codec;
pub mod context;
pub mod error;
pub mod program;
pub mod scope;
pub mod step;

pub use codec::{Field, Schema, Structural};
pub use context::{Context, ContextBuilder, Conversation, Message, StepHooks};
pub use error::{
    BindError, CodecError, DefinitionError, EngineError, Interrupt, ProtocolError, ReplayError,
    ScopeError,
};
pub use program::Program;
pub use scope::{CallGuard, CallId, GenerationScope, ScopeHandle, ScopeId};
pub use step::{Args, BoundArgs, Param, Step, StepBuilder, StepDefinition};
