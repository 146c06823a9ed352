//! Entity type declarations.
//!
//! An application describes each entity type once: declared fields with
//! their defaults, a handler table, and the optional alarm and after-load
//! hooks. The catalog is built during program init and handed to
//! [`crate::Runtime::start`]; activation consults it by type name. Handler
//! and field names are interned so alarm delivery can resolve names cheaply
//! and detect orphans.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use store::{KeyPolicy, StateDoc, Symbol};

use crate::error::{Result, RuntimeError};
use crate::state::EntityView;

/// What a handler chose to do.
///
/// `ReplyWith`-style variants persist the new state before the reply is
/// sent; the alarm directive commits only after the state is durable.
pub enum Outcome {
    /// Reply without touching state.
    Reply(Value),
    /// Reply and replace the state.
    ReplyWith(Value, StateDoc),
    /// Reply, replace the state, and schedule an alarm.
    ReplyWithAlarm(Value, StateDoc, AlarmDirective),
    /// Replace the state; the caller gets an empty acknowledgement.
    Update(StateDoc),
    /// Replace the state and schedule an alarm.
    UpdateWithAlarm(StateDoc, AlarmDirective),
    /// Fail; state is untouched and the cause goes back verbatim.
    Fail(Value),
}

/// What an alarm handler chose to do. The alarm entry never produces a
/// caller-visible reply, so the shape is restricted by construction.
pub enum AlarmOutcome {
    Update(StateDoc),
    UpdateWithAlarm(StateDoc, AlarmDirective),
    Fail(Value),
}

/// A request to (re)schedule a named alarm after `delay`.
#[derive(Clone, Debug)]
pub struct AlarmDirective {
    pub name: Symbol,
    pub delay: Duration,
}

impl AlarmDirective {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: Symbol::intern(name),
            delay,
        }
    }
}

/// Result of the after-load hook: the state to continue with, plus an
/// optional alarm directive. Both the state-only and state-plus-alarm
/// shapes are expressible.
pub struct AfterLoad {
    pub state: StateDoc,
    pub alarm: Option<AlarmDirective>,
}

impl AfterLoad {
    pub fn state(state: StateDoc) -> Self {
        Self { state, alarm: None }
    }

    pub fn with_alarm(state: StateDoc, alarm: AlarmDirective) -> Self {
        Self {
            state,
            alarm: Some(alarm),
        }
    }
}

pub type HandlerFn =
    Arc<dyn Fn(Vec<Value>, EntityView) -> BoxFuture<'static, Outcome> + Send + Sync>;
pub type AlarmFn =
    Arc<dyn Fn(Symbol, EntityView) -> BoxFuture<'static, AlarmOutcome> + Send + Sync>;
pub type AfterLoadFn = Arc<
    dyn Fn(StateDoc) -> BoxFuture<'static, std::result::Result<AfterLoad, Value>> + Send + Sync,
>;

pub struct HandlerEntry {
    pub arity: usize,
    pub call: HandlerFn,
}

/// Per-kind overrides of the process-wide configuration. Unset fields fall
/// through to [`crate::RuntimeConfig`].
#[derive(Clone, Debug, Default)]
pub struct KindOptions {
    pub hibernate_after: Option<Duration>,
    pub shutdown_after: Option<Duration>,
    pub object_keys: Option<KeyPolicy>,
    pub prefix: Option<String>,
}

/// One registered entity type.
pub struct KindSpec {
    name: String,
    defaults: StateDoc,
    handlers: HashMap<&'static str, HandlerEntry>,
    on_alarm: Option<AlarmFn>,
    after_load: Option<AfterLoadFn>,
    options: KindOptions,
}

impl std::fmt::Debug for KindSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindSpec")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("has_on_alarm", &self.on_alarm.is_some())
            .field("has_after_load", &self.after_load.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl KindSpec {
    pub fn builder(name: impl Into<String>) -> KindSpecBuilder {
        KindSpecBuilder {
            name: name.into(),
            defaults: StateDoc::new(),
            handlers: HashMap::new(),
            on_alarm: None,
            after_load: None,
            options: KindOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &StateDoc {
        &self.defaults
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerEntry> {
        self.handlers.get(name)
    }

    pub fn on_alarm(&self) -> Option<&AlarmFn> {
        self.on_alarm.as_ref()
    }

    pub fn after_load(&self) -> Option<&AfterLoadFn> {
        self.after_load.as_ref()
    }

    pub fn options(&self) -> &KindOptions {
        &self.options
    }
}

pub struct KindSpecBuilder {
    name: String,
    defaults: StateDoc,
    handlers: HashMap<&'static str, HandlerEntry>,
    on_alarm: Option<AlarmFn>,
    after_load: Option<AfterLoadFn>,
    options: KindOptions,
}

impl KindSpecBuilder {
    /// Declare a field and its default value.
    pub fn field(mut self, name: &str, default: Value) -> Self {
        Symbol::intern(name);
        self.defaults.insert(name.to_owned(), default);
        self
    }

    /// Declare a handler. `arity` is the number of caller arguments; the
    /// state view is passed separately.
    pub fn handler<F, Fut>(mut self, name: &str, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>, EntityView) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Outcome> + Send + 'static,
    {
        let sym = Symbol::intern(name);
        self.handlers.insert(
            sym.as_str(),
            HandlerEntry {
                arity,
                call: Arc::new(move |args, view| Box::pin(f(args, view))),
            },
        );
        self
    }

    /// Declare an alarm name this kind responds to. Declared names survive
    /// a process restart: a durable alarm row whose name was never declared
    /// (or scheduled) in the current run is treated as an orphan.
    pub fn alarm(self, name: &str) -> Self {
        Symbol::intern(name);
        self
    }

    pub fn on_alarm<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Symbol, EntityView) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = AlarmOutcome> + Send + 'static,
    {
        self.on_alarm = Some(Arc::new(move |name, view| Box::pin(f(name, view))));
        self
    }

    pub fn after_load<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StateDoc) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<AfterLoad, Value>> + Send + 'static,
    {
        self.after_load = Some(Arc::new(move |state| Box::pin(f(state))));
        self
    }

    pub fn hibernate_after(mut self, d: Duration) -> Self {
        self.options.hibernate_after = Some(d);
        self
    }

    pub fn shutdown_after(mut self, d: Duration) -> Self {
        self.options.shutdown_after = Some(d);
        self
    }

    pub fn object_keys(mut self, policy: KeyPolicy) -> Self {
        self.options.object_keys = Some(policy);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<KindSpec> {
        if self.defaults.contains_key("id") {
            // The runtime injects a read-only `id` into every view; a
            // declared field may not shadow it.
            return Err(RuntimeError::InvalidDefinition(format!(
                "entity type {} declares a field named `id`",
                self.name
            )));
        }
        Ok(KindSpec {
            name: self.name,
            defaults: self.defaults,
            handlers: self.handlers,
            on_alarm: self.on_alarm,
            after_load: self.after_load,
            options: self.options,
        })
    }
}

/// All registered entity types, consulted by activation.
#[derive(Clone, Default)]
pub struct Catalog {
    kinds: HashMap<String, Arc<KindSpec>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: KindSpec) -> &mut Self {
        self.kinds.insert(spec.name.clone(), Arc::new(spec));
        self
    }

    pub fn with(mut self, spec: KindSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<KindSpec>> {
        self.kinds.get(kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_field_is_rejected_at_definition_time() {
        let err = KindSpec::builder("bad")
            .field("id", json!(""))
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidDefinition(_)));
    }

    #[test]
    fn builder_collects_fields_and_handlers() {
        let spec = KindSpec::builder("counter")
            .field("count", json!(0))
            .handler("get", 0, |_args, view| async move {
                Outcome::Reply(view.get("count").cloned().unwrap_or(json!(null)))
            })
            .build()
            .unwrap();
        assert_eq!(spec.name(), "counter");
        assert_eq!(spec.defaults().get("count"), Some(&json!(0)));
        assert_eq!(spec.handler("get").map(|h| h.arity), Some(0));
        assert!(spec.handler("missing").is_none());
    }
}
