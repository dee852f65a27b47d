//! Persisted conversation state.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{CallId, Message, ScopeId};

/// Encoded step results keyed by call id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCache(BTreeMap<CallId, Value>);

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &CallId) -> Option<&Value> {
        self.0.get(call_id)
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.0.contains_key(call_id)
    }

    /// Insert unless an entry already exists. Returns whether it was inserted.
    pub fn insert_new(&mut self, call_id: CallId, value: Value) -> bool {
        match self.0.entry(call_id) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CallId, &Value)> {
        self.0.iter()
    }

    /// Entries recorded under `scope_id`.
    pub fn for_scope(&self, scope_id: ScopeId) -> ResultCache {
        Self(
            self.0
                .iter()
                .filter(|(call_id, _)| call_id.belongs_to(scope_id))
                .map(|(call_id, value)| (call_id.clone(), value.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(CallId, Value)> for ResultCache {
    fn from_iter<I: IntoIterator<Item = (CallId, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything needed to resume a conversation in a fresh process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub scope_ids: Vec<ScopeId>,
    pub transcript: Vec<Message>,
    pub cache: ResultCache,
    #[serde(default)]
    pub ended: bool,
    /// Encoded entry result, once ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Bound entry arguments of the first turn; later turns must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_args: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TurnRecord {
    fn default() -> Self {
        Self {
            scope_ids: Vec::new(),
            transcript: Vec::new(),
            cache: ResultCache::new(),
            ended: false,
            result: None,
            entry_args: None,
            updated_at: Utc::now(),
        }
    }
}

impl TurnRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read turn record {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse turn record {}", path.display()))
    }

    /// Load `path`, or start an empty record when it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write turn record {}", path.display()))?;
        Ok(())
    }
}
