//! Error types for the replay engine.

use serde_json::Value;
use thiserror::Error;

use crate::engine::scope::{CallId, ScopeId};

/// A program or step was assembled incorrectly.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("step `{step}` must have accompanying documentation")]
    MissingDocumentation { step: String },

    #[error("step `{step}`: type of {subject} is not representable: {reason}")]
    InvalidSchema {
        step: String,
        subject: String,
        reason: String,
    },

    #[error("step `{step}` declares parameter `{param}` more than once")]
    DuplicateParameter { step: String, param: String },

    #[error("step `{step}`: default for parameter `{param}` does not conform: {source}")]
    InvalidDefault {
        step: String,
        param: String,
        #[source]
        source: CodecError,
    },

    #[error("program `{program}` already has a step named `{step}`")]
    DuplicateStep { program: String, step: String },

    #[error("program `{program}` already has an entry point")]
    DuplicateEntry { program: String },

    #[error("program `{program}` has no entry point")]
    MissingEntry { program: String },
}

/// A value did not conform to the type it was encoded or decoded as.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot interpret {value} as {expected}: {reason}")]
pub struct CodecError {
    /// The offending transport value.
    pub value: Value,
    /// Rendering of the expected type.
    pub expected: String,
    pub reason: String,
}

impl CodecError {
    pub fn new(value: Value, expected: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            value,
            expected: expected.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("no generation scope is active")]
    NoScope,

    #[error("leave without a matching enter in scope {scope_id}")]
    Unbalanced { scope_id: ScopeId },
}

/// Arguments could not be matched against a step's parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    #[error("step `{step}` takes {expected} argument(s) but {got} positional were given")]
    TooManyPositional {
        step: String,
        expected: usize,
        got: usize,
    },

    #[error("step `{step}` has no parameter named `{name}`")]
    UnknownParameter { step: String, name: String },

    #[error("step `{step}` got multiple values for `{name}`")]
    DuplicateArgument { step: String, name: String },

    #[error("step `{step}` is missing required argument `{name}`")]
    MissingArgument { step: String, name: String },

    #[error("argument `{name}` of step `{step}` is invalid: {source}")]
    InvalidArgument {
        step: String,
        name: String,
        #[source]
        source: CodecError,
    },

    #[error("argument `{name}` cannot be serialized: {reason}")]
    Unserializable { name: String, reason: String },
}

/// The persisted history disagrees with what the program does on replay.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("result cache has no entry for {call_id}")]
    MissingCacheEntry { call_id: CallId },

    #[error("turn {turn} has no scope id ({known} known)")]
    ScopeOutOfRange { turn: usize, known: usize },

    #[error("user input requested inside step call {call_id}")]
    InputInsideStep { call_id: CallId },

    #[error("transcript position {offset} should hold a user message")]
    RoleMismatch { offset: usize },

    #[error("user input requested at position {offset} but the transcript only has {len} message(s)")]
    TranscriptGap { offset: usize, len: usize },

    #[error("the turn ended without any message in the transcript")]
    EmptyTranscript,

    #[error("entry arguments {given} differ from {recorded}, which this conversation started with")]
    EntryArgsChanged { recorded: Value, given: Value },
}

/// The caller or the program used a conversation the wrong way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no conversation is attached to this context")]
    NoConversation,

    #[error("the conversation has already ended")]
    ConversationEnded,

    #[error("the conversation has not ended yet")]
    NotEnded,

    #[error("the last message is not an assistant message")]
    NotAwaitingReply,

    #[error("message channel closed")]
    ChannelClosed,

    #[error("program configuration is not available")]
    ConfigUnavailable,

    #[error("the live conversation cannot suspend")]
    UnexpectedSuspend,
}

/// Any failure surfaced by the engine or a step body.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("conversation task failed: {0}")]
    Task(String),

    /// Failure raised by a step body.
    #[error(transparent)]
    Body(#[from] anyhow::Error),
}

/// How a program body stops early.
///
/// `Suspend` is not a failure: it is raised by the resume driver when the known
/// transcript is exhausted and is turned into [`TurnOutcome::Suspended`].
///
/// [`TurnOutcome::Suspended`]: crate::executor::TurnOutcome::Suspended
#[derive(Error, Debug)]
pub enum Interrupt {
    #[error("suspended awaiting user input")]
    Suspend,

    #[error(transparent)]
    Failed(#[from] EngineError),
}

impl Interrupt {
    pub fn is_suspend(&self) -> bool {
        matches!(self, Interrupt::Suspend)
    }
}

macro_rules! interrupt_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Interrupt {
                fn from(err: $ty) -> Self {
                    Interrupt::Failed(err.into())
                }
            }
        )*
    };
}

interrupt_from!(
    DefinitionError,
    CodecError,
    ScopeError,
    BindError,
    ReplayError,
    ProtocolError,
    anyhow::Error,
);
