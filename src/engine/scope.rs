//! Positional call identities.
//!
//! Every step invocation within one turn gets a [`CallId`] derived only from its
//! nesting depth and its position among siblings, never from its arguments. Two
//! replays that follow the same control flow therefore produce the same ids,
//! which is what lets the result cache be keyed without hashing content.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::error::ScopeError;

/// Identifies one conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `scope_id/n0/n1/.../nk`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(scope_id: ScopeId, positions: &[u32]) -> Self {
        let mut id = scope_id.to_string();
        for position in positions {
            id.push('/');
            id.push_str(&position.to_string());
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was produced under `scope_id`.
    pub fn belongs_to(&self, scope_id: ScopeId) -> bool {
        let prefix = scope_id.to_string();
        self.0 == prefix
            || (self.0.starts_with(&prefix) && self.0.as_bytes().get(prefix.len()) == Some(&b'/'))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Per-turn position bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationScope {
    scope_id: ScopeId,
    position_stack: Vec<u32>,
    next_sibling: u32,
}

impl GenerationScope {
    pub fn new(scope_id: ScopeId) -> Self {
        Self {
            scope_id,
            position_stack: Vec::new(),
            next_sibling: 0,
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope_id
    }

    pub fn depth(&self) -> usize {
        self.position_stack.len()
    }

    /// Enter a nested call.
    pub fn enter(&mut self) {
        self.position_stack.push(self.next_sibling);
        self.next_sibling = 0;
    }

    /// Leave the current call so the next sibling gets the following position.
    pub fn leave(&mut self) -> Result<(), ScopeError> {
        let position = self.position_stack.pop().ok_or(ScopeError::Unbalanced {
            scope_id: self.scope_id,
        })?;
        self.next_sibling = position + 1;
        Ok(())
    }

    pub fn current_id(&self) -> CallId {
        CallId::new(self.scope_id, &self.position_stack)
    }
}

/// Shared handle to the scope of one execution.
///
/// The driver and the [`Context`](crate::engine::Context) hold clones of the
/// same handle; the driver switches scopes at turn boundaries while steps enter
/// and leave calls through it.
#[derive(Debug, Clone, Default)]
pub struct ScopeHandle {
    inner: Arc<Mutex<Option<GenerationScope>>>,
}

impl ScopeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh scope, discarding any position state.
    pub fn begin_scope(&self, scope_id: ScopeId) {
        *self.inner.lock() = Some(GenerationScope::new(scope_id));
    }

    pub fn end_scope(&self) {
        *self.inner.lock() = None;
    }

    pub fn scope_id(&self) -> Option<ScopeId> {
        self.inner.lock().as_ref().map(GenerationScope::scope_id)
    }

    /// Nesting depth, or `None` without a scope.
    pub fn depth(&self) -> Option<usize> {
        self.inner.lock().as_ref().map(GenerationScope::depth)
    }

    pub fn current_id(&self) -> Result<CallId, ScopeError> {
        self.inner
            .lock()
            .as_ref()
            .map(GenerationScope::current_id)
            .ok_or(ScopeError::NoScope)
    }

    /// Enter a call, returning a guard that leaves it when dropped.
    ///
    /// Without an active scope this is a no-op.
    pub fn enter(&self) -> CallGuard {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(scope) => {
                scope.enter();
                CallGuard {
                    handle: Some(self.clone()),
                    scope_id: Some(scope.scope_id()),
                }
            }
            None => CallGuard {
                handle: None,
                scope_id: None,
            },
        }
    }

    fn leave(&self, entered_in: ScopeId) {
        let mut guard = self.inner.lock();
        let Some(scope) = guard.as_mut() else {
            return;
        };
        if scope.scope_id() != entered_in {
            tracing::warn!(
                entered_in = %entered_in,
                current = %scope.scope_id(),
                "scope changed inside a step call; skipping leave"
            );
            return;
        }
        if let Err(err) = scope.leave() {
            tracing::warn!(error = %err, "unbalanced call guard");
        }
    }
}

/// Leaves the entered call on drop, on every exit path.
#[must_use = "dropping the guard immediately leaves the call"]
#[derive(Debug)]
pub struct CallGuard {
    handle: Option<ScopeHandle>,
    scope_id: Option<ScopeId>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let (Some(handle), Some(scope_id)) = (self.handle.take(), self.scope_id) {
            handle.leave(scope_id);
        }
    }
}
