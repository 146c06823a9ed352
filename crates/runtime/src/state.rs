//! State documents and the handler-visible view.

use serde_json::Value;
use std::sync::Arc;

use store::StateDoc;

/// What a handler sees: the declared fields plus the entity `id`, injected
/// after load and never persisted.
#[derive(Clone, Debug)]
pub struct EntityView {
    id: Arc<str>,
    state: StateDoc,
}

impl EntityView {
    pub(crate) fn new(id: Arc<str>, state: StateDoc) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.state.get(field)
    }

    pub fn state(&self) -> &StateDoc {
        &self.state
    }

    /// Consume the view into a mutable state document, e.g. to build the
    /// next state from the current one.
    pub fn into_state(self) -> StateDoc {
        self.state
    }

    /// Integer convenience accessor; missing or non-integer fields read 0.
    pub fn get_i64(&self, field: &str) -> i64 {
        self.state
            .get(field)
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }
}

/// Merge a stored document over the declared defaults: declared fields keep
/// the stored value when present, missing fields adopt their default, and
/// keys outside the declaration are dropped.
pub fn merge_defaults(defaults: &StateDoc, mut stored: StateDoc) -> StateDoc {
    let mut merged = StateDoc::new();
    for (field, default) in defaults {
        let value = stored.remove(field).unwrap_or_else(|| default.clone());
        merged.insert(field.clone(), value);
    }
    merged
}

/// Restrict a handler-produced document to the declared fields, filling in
/// defaults for anything it dropped. Saved documents never grow undeclared
/// keys.
pub fn restrict_to_declared(defaults: &StateDoc, state: StateDoc) -> StateDoc {
    merge_defaults(defaults, state)
}
