//! Interned symbols and key-conversion policies.
//!
//! Stored documents are plain JSON with string keys. Depending on the
//! configured policy, nested keys inside field values are mapped to interned
//! symbols when a document is loaded: `ExistingSymbols` requires every nested
//! key to be known already and fails the load otherwise, `CreateSymbols`
//! interns new keys on sight, and `Strings` leaves documents untouched.
//!
//! Symbols are also the identifiers for handler and alarm names. Interned
//! strings live for the process lifetime.

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Result, StoreError};

static INTERNER: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();

fn interner() -> &'static Mutex<HashSet<&'static str>> {
    INTERNER.get_or_init(|| Mutex::new(HashSet::new()))
}

/// An interned name with process lifetime. Comparison is pointer-cheap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(&'static str);

impl Symbol {
    /// Intern `name`, registering it if it was not seen before.
    pub fn intern(name: &str) -> Symbol {
        let mut set = interner().lock();
        if let Some(existing) = set.get(name) {
            return Symbol(*existing);
        }
        let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
        set.insert(leaked);
        Symbol(leaked)
    }

    /// Resolve `name` only if it was interned before.
    pub fn existing(name: &str) -> Option<Symbol> {
        interner().lock().get(name).copied().map(Symbol)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// How nested keys inside stored field values are treated on load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Keys stay plain strings.
    #[default]
    Strings,
    /// Keys must resolve to already-interned symbols; unknown keys fail the load.
    ExistingSymbols,
    /// Keys are interned, creating symbols as needed.
    CreateSymbols,
}

/// Apply `policy` to every nested map key inside `value`.
///
/// Top-level keys are the declared field names and are handled by the
/// runtime's merge; this walks the values below them.
pub fn apply_key_policy(value: &Value, policy: KeyPolicy) -> Result<()> {
    match policy {
        KeyPolicy::Strings => Ok(()),
        KeyPolicy::ExistingSymbols | KeyPolicy::CreateSymbols => walk(value, policy),
    }
}

fn walk(value: &Value, policy: KeyPolicy) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                match policy {
                    KeyPolicy::ExistingSymbols => {
                        if Symbol::existing(key).is_none() {
                            return Err(StoreError::UnknownKey(key.clone()));
                        }
                    }
                    KeyPolicy::CreateSymbols => {
                        Symbol::intern(key);
                    }
                    KeyPolicy::Strings => {}
                }
                walk(nested, policy)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                walk(item, policy)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn intern_is_idempotent() {
        let a = Symbol::intern("tick");
        let b = Symbol::intern("tick");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "tick");
        assert_eq!(Symbol::existing("tick"), Some(a));
    }

    #[test]
    fn existing_misses_unknown_names() {
        assert!(Symbol::existing("never_interned_name_xyz").is_none());
    }

    #[test]
    fn strings_policy_accepts_anything() {
        let doc = json!({"outer": {"whatever_key": 1}});
        assert!(apply_key_policy(&doc, KeyPolicy::Strings).is_ok());
    }

    #[test]
    fn existing_symbols_rejects_unknown_nested_keys() {
        let doc = json!({"nested": {"unregistered_nested_key": true}});
        let err = apply_key_policy(&doc, KeyPolicy::ExistingSymbols).unwrap_err();
        assert!(matches!(err, StoreError::UnknownKey(k) if k == "unregistered_nested_key"));
    }

    #[test]
    fn existing_symbols_accepts_known_keys_recursively() {
        Symbol::intern("inner");
        Symbol::intern("deep");
        let doc = json!({"field": {"inner": {"deep": [1, 2]}}});
        assert!(apply_key_policy(&doc, KeyPolicy::ExistingSymbols).is_ok());
    }

    #[test]
    fn create_symbols_registers_new_keys() {
        let doc = json!({"field": {"freshly_created_key": 1}});
        apply_key_policy(&doc, KeyPolicy::CreateSymbols).unwrap();
        assert!(Symbol::existing("freshly_created_key").is_some());
    }

    #[test]
    fn arrays_are_walked() {
        let doc = json!({"list": [{"array_nested_key": 0}]});
        let err = apply_key_policy(&doc, KeyPolicy::ExistingSymbols).unwrap_err();
        assert!(matches!(err, StoreError::UnknownKey(_)));
    }
}
