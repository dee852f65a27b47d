//! Stateless, replay-based resume.
//!
//! A [`StepExecutor`] advances a conversation by exactly one turn. It replays
//! the program from the top against the known transcript, answering every step
//! call from the result cache, until it reaches the frontier: the last user
//! message. From there it records, running steps live and caching their
//! results, until the program asks for input nobody has given yet (the turn
//! suspends) or the entry returns (the conversation ends).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::Instrument;

use crate::engine::codec::{self, Structural};
use crate::engine::{
    Args, BoundArgs, CallId, Context, Conversation, EngineError, Interrupt, Message, Program,
    ProtocolError, ReplayError, ScopeHandle, ScopeId, StepDefinition, StepHooks,
};
use crate::executor::record::{ResultCache, TurnRecord};

/// What one turn produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome<R> {
    /// The program is waiting for a user reply to `message`.
    Suspended { message: Message },
    /// The entry returned `value`; `message` is the last transcript entry.
    Completed { message: Message, value: R },
}

impl<R> TurnOutcome<R> {
    pub fn message(&self) -> &Message {
        match self {
            TurnOutcome::Suspended { message } | TurnOutcome::Completed { message, .. } => message,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}

/// Working state of one run. Mutated only through the harness.
#[derive(Debug, Default)]
struct ReplayState {
    transcript: Vec<Message>,
    cache: ResultCache,
    delta: ResultCache,
    scope_ids: Vec<ScopeId>,
    /// Index of the turn being replayed or recorded.
    turn: usize,
    recording: bool,
}

/// Cache hooks and conversation endpoints for one [`StepExecutor::run`].
struct ReplayHarness {
    state: Arc<Mutex<ReplayState>>,
    scope: ScopeHandle,
}

impl StepHooks for ReplayHarness {
    fn lookup(&self, call_id: &CallId) -> Result<Option<Value>, ReplayError> {
        let state = self.state.lock();
        if state.recording {
            tracing::debug!(call_id = %call_id, "recording; running step");
            return Ok(None);
        }
        state
            .cache
            .get(call_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| ReplayError::MissingCacheEntry {
                call_id: call_id.clone(),
            })
    }

    fn complete(&self, call_id: &CallId, step: &StepDefinition, _args: &BoundArgs, encoded: Value) {
        let mut state = self.state.lock();
        if !state.recording {
            return;
        }
        if state.cache.insert_new(call_id.clone(), encoded.clone()) {
            state.delta.insert_new(call_id.clone(), encoded);
        } else {
            tracing::warn!(
                call_id = %call_id,
                step = %step.name,
                "result already cached; keeping the existing entry"
            );
        }
    }
}

#[async_trait]
impl Conversation for ReplayHarness {
    async fn next_user_message(&self) -> Result<Message, Interrupt> {
        if self.scope.depth().is_some_and(|depth| depth > 0) {
            let call_id = self.scope.current_id()?;
            return Err(ReplayError::InputInsideStep { call_id }.into());
        }

        let mut state = self.state.lock();
        let offset = state.turn * 2 + 1;
        let len = state.transcript.len();
        if offset == len {
            tracing::debug!(turn = state.turn, offset, "frontier reached; suspending");
            return Err(Interrupt::Suspend);
        }
        if offset > len {
            return Err(ReplayError::TranscriptGap { offset, len }.into());
        }
        let message = state.transcript[offset].clone();
        if message.is_from_assistant {
            return Err(ReplayError::RoleMismatch { offset }.into());
        }
        if offset == len - 1 {
            tracing::debug!(turn = state.turn + 1, "replay caught up; recording");
            state.recording = true;
        }

        state.turn += 1;
        let scope_id = *state
            .scope_ids
            .get(state.turn)
            .ok_or(ReplayError::ScopeOutOfRange {
                turn: state.turn,
                known: state.scope_ids.len(),
            })?;
        self.scope.begin_scope(scope_id);
        Ok(message)
    }

    async fn post_assistant_message(&self, text: String) -> Result<(), Interrupt> {
        let mut state = self.state.lock();
        let offset = state.turn * 2;
        if let Some(existing) = state.transcript.get(offset) {
            if !existing.is_from_assistant {
                return Err(ReplayError::RoleMismatch { offset }.into());
            }
            tracing::debug!(offset, "assistant message already in transcript; discarding");
            return Ok(());
        }
        state.transcript.push(Message::assistant(text));
        Ok(())
    }
}

/// Advances a conversation one turn per [`run`](Self::run).
///
/// Between runs the executor holds nothing live: its whole state is the
/// scope ids, transcript and cache, which [`to_record`](Self::to_record)
/// captures for a later [`from_record`](Self::from_record).
pub struct StepExecutor<R> {
    program: Arc<Program<R>>,
    scope_ids: Vec<ScopeId>,
    next_scope_id: ScopeId,
    transcript: Vec<Message>,
    cache: ResultCache,
    delta: ResultCache,
    ended: bool,
    result: Option<(R, Value)>,
    entry_args: Option<Value>,
}

impl<R: Structural> StepExecutor<R> {
    pub fn new(
        program: Arc<Program<R>>,
        scope_ids: Vec<ScopeId>,
        transcript: Vec<Message>,
        cache: ResultCache,
    ) -> Self {
        Self {
            program,
            scope_ids,
            next_scope_id: ScopeId::new(),
            transcript,
            cache,
            delta: ResultCache::new(),
            ended: false,
            result: None,
            entry_args: None,
        }
    }

    /// A new conversation with no history.
    pub fn start(program: Arc<Program<R>>) -> Self {
        Self::new(program, Vec::new(), Vec::new(), ResultCache::new())
    }

    pub fn from_record(program: Arc<Program<R>>, record: TurnRecord) -> Result<Self, EngineError> {
        let result = match record.result {
            Some(encoded) => Some((codec::decode_value::<R>(encoded.clone())?, encoded)),
            None => None,
        };
        Ok(Self {
            ended: record.ended,
            result,
            entry_args: record.entry_args,
            ..Self::new(program, record.scope_ids, record.transcript, record.cache)
        })
    }

    pub fn to_record(&self) -> TurnRecord {
        TurnRecord {
            scope_ids: self.scope_ids.clone(),
            transcript: self.transcript.clone(),
            cache: self.cache.clone(),
            ended: self.ended,
            result: self.result.as_ref().map(|(_, encoded)| encoded.clone()),
            entry_args: self.entry_args.clone(),
            updated_at: chrono::Utc::now(),
        }
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Cache entries recorded by the latest run.
    pub fn delta(&self) -> &ResultCache {
        &self.delta
    }

    pub fn scope_ids(&self) -> &[ScopeId] {
        &self.scope_ids
    }

    /// Scope id the next turn will be recorded under.
    pub fn next_scope_id(&self) -> ScopeId {
        self.next_scope_id
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Bound entry arguments the conversation is pinned to, once a turn has run.
    pub fn entry_args(&self) -> Option<&Value> {
        self.entry_args.as_ref()
    }

    /// The entry's return value once the conversation has ended.
    pub fn result(&self) -> Result<&R, ProtocolError> {
        self.result
            .as_ref()
            .map(|(value, _)| value)
            .ok_or(ProtocolError::NotEnded)
    }

    /// Append the user's reply to the last assistant message.
    pub fn push_user_message(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        if self.ended {
            return Err(ProtocolError::ConversationEnded);
        }
        match self.transcript.last() {
            Some(last) if last.is_from_assistant => {
                self.transcript.push(Message::user(text));
                Ok(())
            }
            _ => Err(ProtocolError::NotAwaitingReply),
        }
    }

    /// Advance the conversation by one turn.
    ///
    /// On error the executor keeps its state from before the call. Every
    /// turn must bind to the same entry arguments as the first one.
    pub async fn run(&mut self, args: Args) -> Result<TurnOutcome<R>, EngineError> {
        if self.ended {
            return Err(ProtocolError::ConversationEnded.into());
        }
        let bound_args = match self.program.entry_definition() {
            Some(definition) => Some(definition.bind(args.clone())?.to_value()),
            None => None,
        };
        if let (Some(recorded), Some(given)) = (&self.entry_args, &bound_args) {
            if recorded != given {
                return Err(ReplayError::EntryArgsChanged {
                    recorded: recorded.clone(),
                    given: given.clone(),
                }
                .into());
            }
        }

        let mut scope_ids = self.scope_ids.clone();
        scope_ids.push(self.next_scope_id);
        let first_scope = scope_ids[0];

        let state = Arc::new(Mutex::new(ReplayState {
            transcript: self.transcript.clone(),
            cache: self.cache.clone(),
            delta: ResultCache::new(),
            scope_ids,
            turn: 0,
            recording: self.transcript.is_empty(),
        }));
        let scope = ScopeHandle::new();
        scope.begin_scope(first_scope);
        let harness = Arc::new(ReplayHarness {
            state: state.clone(),
            scope: scope.clone(),
        });
        let cx = Context::builder()
            .scope(scope.clone())
            .hooks(harness.clone())
            .conversation(harness)
            .build();

        let span = tracing::info_span!(
            "turn",
            program = %self.program.name(),
            known_messages = self.transcript.len()
        );
        let outcome = self.program.run(&cx, args).instrument(span).await;
        scope.end_scope();
        drop(cx);

        let state = std::mem::take(&mut *state.lock());
        let value = match outcome {
            Ok(value) => Some(value),
            Err(Interrupt::Suspend) => None,
            Err(Interrupt::Failed(err)) => {
                tracing::warn!(error = %err, turn = state.turn, "turn aborted");
                return Err(err);
            }
        };
        let message = state
            .transcript
            .last()
            .cloned()
            .ok_or(ReplayError::EmptyTranscript)?;
        let encoded = value.as_ref().map(codec::encode_value).transpose()?;

        self.commit(state);
        if self.entry_args.is_none() {
            self.entry_args = bound_args;
        }
        match (value, encoded) {
            (Some(value), Some(encoded)) => {
                tracing::info!(turns = self.scope_ids.len(), "conversation completed");
                self.ended = true;
                self.result = Some((value.clone(), encoded));
                Ok(TurnOutcome::Completed { message, value })
            }
            _ => {
                tracing::info!(turns = self.scope_ids.len(), "turn suspended");
                Ok(TurnOutcome::Suspended { message })
            }
        }
    }

    fn commit(&mut self, mut state: ReplayState) {
        // Ids past the last turn actually reached were never used.
        state.scope_ids.truncate(state.turn + 1);
        if state.scope_ids.last() == Some(&self.next_scope_id) {
            self.next_scope_id = ScopeId::new();
        }
        self.scope_ids = state.scope_ids;
        self.transcript = state.transcript;
        self.cache = state.cache;
        self.delta = state.delta;
    }
}
