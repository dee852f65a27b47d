//! Per-execution capabilities.
//!
//! A [`Context`] carries everything a step body can reach during one run: the
//! scope used to number calls, the optional cache hooks, the conversation
//! endpoints and the program's run-scoped configuration. Each driver builds its
//! own context, so concurrent conversations never share capabilities.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::error::{Interrupt, ProtocolError, ReplayError};
use crate::engine::scope::{CallId, ScopeHandle};
use crate::engine::step::{BoundArgs, StepDefinition};

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub is_from_assistant: bool,
    pub text: String,
}

impl Message {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            is_from_assistant: true,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            is_from_assistant: false,
            text: text.into(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.is_from_assistant {
            "Assistant"
        } else {
            "User"
        };
        write!(f, "{role}: {}", self.text)
    }
}

/// Input-request and output-delivery endpoints of a conversation.
#[async_trait]
pub trait Conversation: Send + Sync {
    /// The next user message, or [`Interrupt::Suspend`] when none is known yet.
    async fn next_user_message(&self) -> Result<Message, Interrupt>;

    async fn post_assistant_message(&self, text: String) -> Result<(), Interrupt>;
}

/// Cache-check and record hooks consulted by every step invocation.
pub trait StepHooks: Send + Sync {
    /// A previously recorded result for `call_id`, if this call should not run.
    fn lookup(&self, call_id: &CallId) -> Result<Option<Value>, ReplayError>;

    /// Called after a step body ran, with its encoded result.
    fn complete(&self, call_id: &CallId, step: &StepDefinition, args: &BoundArgs, encoded: Value);
}

type ConfigSlot = Mutex<Option<Arc<dyn Any + Send + Sync>>>;

struct ContextInner {
    scope: ScopeHandle,
    hooks: Option<Arc<dyn StepHooks>>,
    conversation: Option<Arc<dyn Conversation>>,
    config: ConfigSlot,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// No scope, no hooks, no conversation. Steps run live and unnumbered.
    pub fn detached() -> Self {
        Self::builder().build()
    }

    pub fn scope(&self) -> &ScopeHandle {
        &self.inner.scope
    }

    pub fn hooks(&self) -> Option<&Arc<dyn StepHooks>> {
        self.inner.hooks.as_ref()
    }

    fn conversation(&self) -> Result<&Arc<dyn Conversation>, ProtocolError> {
        self.inner
            .conversation
            .as_ref()
            .ok_or(ProtocolError::NoConversation)
    }

    pub async fn next_user_message(&self) -> Result<Message, Interrupt> {
        self.conversation()?.next_user_message().await
    }

    /// Text of the next user message.
    pub async fn get_user_reply(&self) -> Result<String, Interrupt> {
        Ok(self.next_user_message().await?.text)
    }

    pub async fn post_assistant_reply(&self, text: impl Into<String>) -> Result<(), Interrupt> {
        self.conversation()?
            .post_assistant_message(text.into())
            .await
    }

    /// The configuration installed by the running program.
    pub fn config<C: Any + Send + Sync>(&self) -> Result<Arc<C>, ProtocolError> {
        let slot = self.inner.config.lock().clone();
        slot.and_then(|config| config.downcast::<C>().ok())
            .ok_or(ProtocolError::ConfigUnavailable)
    }

    pub(crate) fn install_config(&self, config: Arc<dyn Any + Send + Sync>) -> ConfigGuard {
        *self.inner.config.lock() = Some(config);
        ConfigGuard {
            context: self.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("scope", &self.inner.scope.scope_id())
            .field("hooks", &self.inner.hooks.is_some())
            .field("conversation", &self.inner.conversation.is_some())
            .finish()
    }
}

/// Clears the installed configuration when the run ends.
pub(crate) struct ConfigGuard {
    context: Context,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        *self.context.inner.config.lock() = None;
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    scope: Option<ScopeHandle>,
    hooks: Option<Arc<dyn StepHooks>>,
    conversation: Option<Arc<dyn Conversation>>,
}

impl ContextBuilder {
    pub fn scope(mut self, scope: ScopeHandle) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn StepHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn conversation(mut self, conversation: Arc<dyn Conversation>) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn build(self) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                scope: self.scope.unwrap_or_default(),
                hooks: self.hooks,
                conversation: self.conversation,
                config: Mutex::new(None),
            }),
        }
    }
}
