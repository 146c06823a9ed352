//! Per-entity instances.
//!
//! An instance is one tokio task owning one entity's state, fed by an mpsc
//! mailbox. Messages are processed strictly one at a time, which is what
//! makes per-entity state transitions linearize in arrival order. The
//! lifetime is activation, load, serve, terminate; termination on idle is
//! ordinary because the state is already durable and the next call simply
//! reactivates.

use std::sync::Arc;
use std::time::Duration;

use scheduler::{AlarmScheduler, FireOutcome};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use store::{EntityKey, KeyPolicy, ObjectStore, StateDoc, Symbol, apply_key_policy};

use crate::catalog::{AlarmDirective, AlarmOutcome, KindSpec, Outcome};
use crate::error::RuntimeError;
use crate::registry::LocalRegistry;
use crate::state::{EntityView, merge_defaults, restrict_to_declared};

pub type InvokeResult = Result<Option<Value>, RuntimeError>;

/// Why an instance stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Idle shutdown or an explicit deactivate; reactivation is expected.
    Normal,
    /// Supervisor-driven stop with an application-provided reason.
    Requested(String),
    /// The runtime is shutting down.
    Shutdown,
}

pub(crate) enum Msg {
    Invoke {
        handler: String,
        args: Vec<Value>,
        reply: oneshot::Sender<InvokeResult>,
    },
    Fire {
        name: String,
        reply: oneshot::Sender<FireOutcome>,
    },
    Stop {
        reason: StopReason,
        ack: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable address of a live local instance.
#[derive(Clone)]
pub struct LocalHandle {
    pub(crate) key: EntityKey,
    pub(crate) epoch: u64,
    pub(crate) sender: mpsc::Sender<Msg>,
    pub(crate) cancel: CancellationToken,
}

impl LocalHandle {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Send an invocation and wait for the reply up to `deadline`. The
    /// instance may still complete and persist after the caller gives up.
    pub async fn invoke(
        &self,
        handler: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> InvokeResult {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Msg::Invoke {
                handler: handler.to_owned(),
                args,
                reply: tx,
            })
            .await
            .map_err(|_| RuntimeError::MailboxClosed)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::MailboxClosed),
            Err(_) => Err(RuntimeError::Timeout),
        }
    }

    pub async fn fire(&self, name: &str) -> Result<FireOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Msg::Fire {
                name: name.to_owned(),
                reply: tx,
            })
            .await
            .map_err(|_| RuntimeError::MailboxClosed)?;
        rx.await.map_err(|_| RuntimeError::MailboxClosed)
    }

    /// Ask the instance to stop and wait until it acknowledged.
    pub async fn stop(&self, reason: StopReason) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Msg::Stop { reason, ack: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }
}

/// Everything an instance task needs, resolved at activation time.
pub(crate) struct InstanceCtx {
    pub key: EntityKey,
    pub kind: Arc<KindSpec>,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub scheduler: Arc<dyn AlarmScheduler>,
    pub registry: Arc<LocalRegistry>,
    pub epoch: u64,
    pub prefix: Option<String>,
    pub policy: KeyPolicy,
    pub hibernate_after: Option<Duration>,
    pub shutdown_after: Option<Duration>,
    pub cancel: CancellationToken,
}

pub(crate) async fn run(
    ctx: InstanceCtx,
    mut mailbox: mpsc::Receiver<Msg>,
    ready: oneshot::Sender<Result<(), RuntimeError>>,
) {
    let mut worker = match Worker::load(&ctx).await {
        Ok(worker) => {
            let _ = ready.send(Ok(()));
            worker
        }
        Err(e) => {
            debug!(key = %ctx.key, "activation failed during load: {e}");
            ctx.registry.remove_if_epoch(&ctx.key, ctx.epoch);
            let _ = ready.send(Err(e));
            return;
        }
    };

    debug!(key = %ctx.key, "instance ready");
    let mut last_activity = Instant::now();
    let mut hibernated = false;
    let mut reason = StopReason::Normal;

    loop {
        let hibernate_deadline =
            last_activity + ctx.hibernate_after.unwrap_or(Duration::from_secs(0));
        let shutdown_deadline =
            last_activity + ctx.shutdown_after.unwrap_or(Duration::from_secs(0));

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                reason = StopReason::Shutdown;
                break;
            }
            msg = mailbox.recv() => {
                let Some(msg) = msg else { break };
                last_activity = Instant::now();
                hibernated = false;
                match msg {
                    Msg::Invoke { handler, args, reply } => {
                        let result = worker.handle_invoke(&handler, args).await;
                        let _ = reply.send(result);
                    }
                    Msg::Fire { name, reply } => {
                        let outcome = worker.handle_fire(&name).await;
                        let _ = reply.send(outcome);
                    }
                    Msg::Stop { reason: r, ack } => {
                        reason = r;
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(shutdown_deadline), if ctx.shutdown_after.is_some() => {
                reason = StopReason::Normal;
                break;
            }
            _ = tokio::time::sleep_until(hibernate_deadline),
                if ctx.hibernate_after.is_some() && !hibernated =>
            {
                hibernated = true;
                worker.compact();
                debug!(key = %ctx.key, "instance hibernated");
            }
        }
    }

    ctx.registry.remove_if_epoch(&ctx.key, ctx.epoch);
    mailbox.close();
    info!(key = %ctx.key, ?reason, "instance stopped");
}

/// The loaded state plus everything needed to mutate it.
struct Worker<'a> {
    ctx: &'a InstanceCtx,
    id: Arc<str>,
    state: StateDoc,
}

impl<'a> Worker<'a> {
    /// The Loading phase: read or seed the record, apply the key policy,
    /// merge defaults, and run the after-load hook.
    async fn load(ctx: &'a InstanceCtx) -> Result<Worker<'a>, RuntimeError> {
        let defaults = ctx.kind.defaults();
        let state = match &ctx.store {
            Some(store) => {
                let loaded = store
                    .load(&ctx.key, ctx.prefix.as_deref())
                    .await
                    .map_err(|e| RuntimeError::LoadFailed(e.to_string()))?;
                match loaded {
                    Some(record) => {
                        for value in record.state.values() {
                            apply_key_policy(value, ctx.policy)
                                .map_err(|e| RuntimeError::LoadFailed(e.to_string()))?;
                        }
                        merge_defaults(defaults, record.state)
                    }
                    None => {
                        // First activation of this identity: seed the
                        // declared defaults before accepting any work.
                        let seeded = defaults.clone();
                        store
                            .save(&ctx.key, &seeded, ctx.prefix.as_deref())
                            .await
                            .map_err(|e| RuntimeError::PersistenceFailed(e.to_string()))?;
                        seeded
                    }
                }
            }
            None => defaults.clone(),
        };

        let mut worker = Worker {
            ctx,
            id: Arc::from(ctx.key.id.as_str()),
            state,
        };
        worker.run_after_load().await?;
        Ok(worker)
    }

    async fn run_after_load(&mut self) -> Result<(), RuntimeError> {
        let Some(hook) = self.ctx.kind.after_load() else {
            return Ok(());
        };
        let result = hook(self.state.clone())
            .await
            .map_err(|cause| RuntimeError::LoadFailed(cause.to_string()))?;

        let next = restrict_to_declared(self.ctx.kind.defaults(), result.state);
        if next != self.state {
            if let Some(store) = &self.ctx.store {
                store
                    .save(&self.ctx.key, &next, self.ctx.prefix.as_deref())
                    .await
                    .map_err(|e| RuntimeError::PersistenceFailed(e.to_string()))?;
            }
            self.state = next;
        }
        if let Some(directive) = result.alarm {
            self.commit_directive(directive).await;
        }
        Ok(())
    }

    async fn handle_invoke(&mut self, handler: &str, args: Vec<Value>) -> InvokeResult {
        let Some(entry) = self.ctx.kind.handler(handler) else {
            return Err(RuntimeError::UnknownHandler(handler.to_owned()));
        };
        if entry.arity != args.len() {
            // Wrong arity resolves to no callable, same as a missing name.
            return Err(RuntimeError::UnknownHandler(handler.to_owned()));
        }

        let view = EntityView::new(self.id.clone(), self.state.clone());
        match (entry.call)(args, view).await {
            Outcome::Reply(value) => Ok(Some(value)),
            Outcome::ReplyWith(value, next) => {
                self.commit(next, None).await?;
                Ok(Some(value))
            }
            Outcome::ReplyWithAlarm(value, next, directive) => {
                self.commit(next, Some(directive)).await?;
                Ok(Some(value))
            }
            Outcome::Update(next) => {
                self.commit(next, None).await?;
                Ok(None)
            }
            Outcome::UpdateWithAlarm(next, directive) => {
                self.commit(next, Some(directive)).await?;
                Ok(None)
            }
            Outcome::Fail(cause) => Err(RuntimeError::Handler(cause)),
        }
    }

    async fn handle_fire(&mut self, name: &str) -> FireOutcome {
        // An alarm name nobody interned this run belongs to a definition
        // that no longer exists.
        let Some(symbol) = Symbol::existing(name) else {
            return FireOutcome::UnknownTarget;
        };
        let Some(on_alarm) = self.ctx.kind.on_alarm() else {
            return FireOutcome::NoHandler;
        };

        let view = EntityView::new(self.id.clone(), self.state.clone());
        match on_alarm(symbol, view).await {
            AlarmOutcome::Update(next) => match self.commit(next, None).await {
                Ok(()) => FireOutcome::Completed,
                Err(RuntimeError::PersistenceFailed(detail)) => {
                    FireOutcome::PersistenceFailed(detail)
                }
                Err(e) => FireOutcome::Failed(e.to_string()),
            },
            AlarmOutcome::UpdateWithAlarm(next, directive) => {
                match self.commit(next, Some(directive)).await {
                    Ok(()) => FireOutcome::Completed,
                    Err(RuntimeError::PersistenceFailed(detail)) => {
                        FireOutcome::PersistenceFailed(detail)
                    }
                    Err(e) => FireOutcome::Failed(e.to_string()),
                }
            }
            AlarmOutcome::Fail(cause) => FireOutcome::Failed(cause.to_string()),
        }
    }

    /// Transactional mutation: an unchanged document skips the store
    /// entirely; a changed one must persist before the in-memory swap, and a
    /// rejected write leaves the previous state in place everywhere. The
    /// alarm directive commits only after the state is settled.
    async fn commit(
        &mut self,
        next: StateDoc,
        directive: Option<AlarmDirective>,
    ) -> Result<(), RuntimeError> {
        let next = restrict_to_declared(self.ctx.kind.defaults(), next);
        if next != self.state {
            if let Some(store) = &self.ctx.store {
                if let Err(e) = store
                    .save(&self.ctx.key, &next, self.ctx.prefix.as_deref())
                    .await
                {
                    warn!(key = %self.ctx.key, "state write rejected: {e}");
                    return Err(RuntimeError::PersistenceFailed(e.to_string()));
                }
            }
            self.state = next;
        }

        if let Some(directive) = directive {
            self.commit_directive(directive).await;
        }
        Ok(())
    }

    async fn commit_directive(&self, directive: AlarmDirective) {
        if let Err(e) = self
            .ctx
            .scheduler
            .schedule(&self.ctx.key, directive.name.as_str(), directive.delay)
            .await
        {
            // The state change is already durable; the failed directive is
            // reported here and not rolled back.
            error!(
                key = %self.ctx.key,
                alarm = %directive.name,
                "failed to schedule alarm directive: {e}"
            );
        }
    }

    /// Release excess capacity held by the state document.
    fn compact(&mut self) {
        for value in self.state.values_mut() {
            shrink(value);
        }
    }
}

fn shrink(value: &mut Value) {
    match value {
        Value::String(s) => s.shrink_to_fit(),
        Value::Array(items) => {
            items.shrink_to_fit();
            for item in items {
                shrink(item);
            }
        }
        Value::Object(map) => {
            for nested in map.values_mut() {
                shrink(nested);
            }
        }
        _ => {}
    }
}
