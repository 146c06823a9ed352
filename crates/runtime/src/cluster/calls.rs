//! Remote invocation over the shared call table.
//!
//! A caller inserts a pending row addressed to the owning node and polls for
//! the reply; each node runs a call server that claims its pending rows,
//! dispatches them locally and writes the reply back. Alarm firings travel
//! the same way under the reserved handler name `__fire__`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scheduler::FireOutcome;
use sea_orm::Value as DbValue;
use sea_orm::sea_query::{Expr, Query, SimpleExpr};
use sea_orm::ConnectionTrait;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use store::{Database, EntityKey, StoreError, prefixed};

use crate::error::RuntimeError;
use crate::instance::InvokeResult;
use crate::placement::Placement;

use super::node::ClusterCalls;

/// Reserved handler name carrying alarm firings across nodes.
pub(crate) const FIRE_HANDLER: &str = "__fire__";

const STATUS_PENDING: &str = "pending";
const STATUS_EXECUTING: &str = "executing";
const STATUS_DONE: &str = "done";

/// Rows older than this are garbage regardless of status.
const CALL_ROW_TTL: Duration = Duration::from_secs(300);

fn db_err(e: sea_orm::DbErr) -> RuntimeError {
    RuntimeError::ActivationFailed(StoreError::from(e).to_string())
}

/// Client half: submit a call and wait for its reply.
pub struct CallClient {
    db: Database,
    prefix: Option<String>,
    poll_interval: Duration,
}

impl CallClient {
    pub fn new(db: Database, prefix: Option<String>, poll_interval: Duration) -> Self {
        Self {
            db,
            prefix,
            poll_interval,
        }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "cluster_calls")
    }

    pub async fn invoke(
        &self,
        target_node: &str,
        key: &EntityKey,
        handler: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> InvokeResult {
        let reply = self
            .call(target_node, key, handler, Value::Array(args), deadline)
            .await?;
        decode_invoke_reply(&reply)
    }

    pub async fn fire(
        &self,
        target_node: &str,
        key: &EntityKey,
        name: &str,
        deadline: Duration,
    ) -> Result<FireOutcome, RuntimeError> {
        let reply = self
            .call(target_node, key, FIRE_HANDLER, json!([name]), deadline)
            .await?;
        Ok(decode_fire_reply(&reply))
    }

    async fn call(
        &self,
        target_node: &str,
        key: &EntityKey,
        handler: &str,
        args: Value,
        deadline: Duration,
    ) -> Result<Value, RuntimeError> {
        let call_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let values: Vec<DbValue> = vec![
            call_id.clone().into(),
            target_node.to_owned().into(),
            key.kind.clone().into(),
            key.id.clone().into(),
            handler.to_owned().into(),
            args.into(),
            STATUS_PENDING.into(),
            now.into(),
        ];
        let insert = Query::insert()
            .into_table(self.table())
            .columns([
                ClusterCalls::CallId,
                ClusterCalls::TargetNode,
                ClusterCalls::Type,
                ClusterCalls::Id,
                ClusterCalls::Handler,
                ClusterCalls::Args,
                ClusterCalls::Status,
                ClusterCalls::CreatedAt,
            ])
            .values_panic(values.into_iter().map(SimpleExpr::from))
            .to_owned();

        let conn = self.db.connection();
        let backend = conn.get_database_backend();
        conn.execute(backend.build(&insert)).await.map_err(db_err)?;

        let give_up = Instant::now() + deadline;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let query = Query::select()
                .columns([ClusterCalls::Status, ClusterCalls::Reply])
                .from(self.table())
                .and_where(Expr::col(ClusterCalls::CallId).eq(call_id.as_str()))
                .to_owned();
            let row = conn.query_one(backend.build(&query)).await.map_err(db_err)?;

            match row {
                None => {
                    // The row was garbage-collected under us.
                    return Err(RuntimeError::ActivationFailed(format!(
                        "remote call {call_id} vanished"
                    )));
                }
                Some(row) => {
                    let status: String = row.try_get("", "status").map_err(db_err)?;
                    if status == STATUS_DONE {
                        let reply: Option<Value> = row.try_get("", "reply").map_err(db_err)?;
                        self.delete(&call_id).await;
                        return reply.ok_or_else(|| {
                            RuntimeError::ActivationFailed(format!(
                                "remote call {call_id} finished without a reply"
                            ))
                        });
                    }
                }
            }

            if Instant::now() >= give_up {
                // Withdraw the call if it has not started; the server may
                // still execute one that is already in flight.
                self.withdraw(&call_id).await;
                return Err(RuntimeError::Timeout);
            }
        }
    }

    async fn withdraw(&self, call_id: &str) {
        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(ClusterCalls::CallId).eq(call_id))
            .and_where(Expr::col(ClusterCalls::Status).eq(STATUS_PENDING))
            .to_owned();
        let conn = self.db.connection();
        if let Err(e) = conn
            .execute(conn.get_database_backend().build(&delete))
            .await
        {
            debug!(call_id, "failed to withdraw timed-out call: {e}");
        }
    }

    async fn delete(&self, call_id: &str) {
        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(ClusterCalls::CallId).eq(call_id))
            .to_owned();
        let conn = self.db.connection();
        if let Err(e) = conn
            .execute(conn.get_database_backend().build(&delete))
            .await
        {
            debug!(call_id, "failed to delete finished call: {e}");
        }
    }
}

/// Server half: execute calls addressed to this node.
pub struct CallServer {
    db: Database,
    prefix: Option<String>,
    node_id: String,
    placement: Arc<Placement>,
    poll_interval: Duration,
}

impl CallServer {
    pub fn new(
        db: Database,
        prefix: Option<String>,
        node_id: String,
        placement: Arc<Placement>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            prefix,
            node_id,
            placement,
            poll_interval,
        }
    }

    fn table(&self) -> sea_orm::sea_query::Alias {
        prefixed(self.prefix.as_deref(), "cluster_calls")
    }

    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(node = %self.node_id, "call server started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                if let Err(e) = self.serve_pending().await {
                    warn!(node = %self.node_id, "call sweep failed: {e}");
                }
            }
            info!(node = %self.node_id, "call server stopped");
        })
    }

    /// Execute every pending call addressed to this node. Public so tests
    /// can drive the server deterministically.
    pub async fn serve_pending(&self) -> Result<usize, RuntimeError> {
        let conn = self.db.connection();
        let backend = conn.get_database_backend();

        let query = Query::select()
            .columns([
                ClusterCalls::CallId,
                ClusterCalls::Type,
                ClusterCalls::Id,
                ClusterCalls::Handler,
                ClusterCalls::Args,
            ])
            .from(self.table())
            .and_where(Expr::col(ClusterCalls::TargetNode).eq(self.node_id.as_str()))
            .and_where(Expr::col(ClusterCalls::Status).eq(STATUS_PENDING))
            .to_owned();
        let rows = conn.query_all(backend.build(&query)).await.map_err(db_err)?;

        let mut served = 0;
        for row in &rows {
            let call_id: String = row.try_get("", "call_id").map_err(db_err)?;

            let claim = Query::update()
                .table(self.table())
                .value(ClusterCalls::Status, STATUS_EXECUTING)
                .and_where(Expr::col(ClusterCalls::CallId).eq(call_id.as_str()))
                .and_where(Expr::col(ClusterCalls::Status).eq(STATUS_PENDING))
                .to_owned();
            if conn
                .execute(backend.build(&claim))
                .await
                .map_err(db_err)?
                .rows_affected()
                != 1
            {
                continue;
            }

            let key = EntityKey {
                kind: row.try_get("", "type").map_err(db_err)?,
                id: row.try_get("", "id").map_err(db_err)?,
            };
            let handler: String = row.try_get("", "handler").map_err(db_err)?;
            let args: Value = row.try_get("", "args").map_err(db_err)?;

            let reply = self.dispatch(&key, &handler, args).await;
            self.finish(&call_id, reply).await?;
            served += 1;
        }

        self.collect_garbage().await;
        Ok(served)
    }

    async fn dispatch(&self, key: &EntityKey, handler: &str, args: Value) -> Value {
        if handler == FIRE_HANDLER {
            let name = args
                .as_array()
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let outcome = match self.placement.activate(key).await {
                Ok(instance) => match instance.fire(&name).await {
                    Ok(outcome) => outcome,
                    Err(e) => FireOutcome::Failed(e.to_string()),
                },
                Err(RuntimeError::UnknownType(_)) => FireOutcome::UnknownTarget,
                Err(e) => FireOutcome::Failed(e.to_string()),
            };
            return encode_fire_reply(&outcome);
        }

        let args = match args {
            Value::Array(items) => items,
            other => vec![other],
        };
        let result = match self.placement.activate(key).await {
            Ok(instance) => {
                // The caller's deadline gates the reply poll on its side;
                // the server gives the handler a generous bound.
                instance
                    .invoke(&handler, args, Duration::from_secs(60))
                    .await
            }
            Err(e) => Err(e),
        };
        encode_invoke_reply(&result)
    }

    async fn finish(&self, call_id: &str, reply: Value) -> Result<(), RuntimeError> {
        let update = Query::update()
            .table(self.table())
            .value(ClusterCalls::Status, STATUS_DONE)
            .value(ClusterCalls::Reply, reply)
            .and_where(Expr::col(ClusterCalls::CallId).eq(call_id))
            .to_owned();
        let conn = self.db.connection();
        conn.execute(conn.get_database_backend().build(&update))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn collect_garbage(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(CALL_ROW_TTL.as_secs() as i64);
        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(ClusterCalls::TargetNode).eq(self.node_id.as_str()))
            .and_where(Expr::col(ClusterCalls::CreatedAt).lt(cutoff))
            .to_owned();
        let conn = self.db.connection();
        if let Err(e) = conn
            .execute(conn.get_database_backend().build(&delete))
            .await
        {
            debug!("call table cleanup failed: {e}");
        }
    }
}

fn encode_invoke_reply(result: &InvokeResult) -> Value {
    match result {
        Ok(Some(value)) => json!({"status": "ok", "value": value}),
        Ok(None) => json!({"status": "noreply"}),
        Err(e) => json!({"status": "error", "kind": e.kind(), "detail": e.to_string()}),
    }
}

fn decode_invoke_reply(reply: &Value) -> InvokeResult {
    match reply.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(Some(reply.get("value").cloned().unwrap_or(Value::Null))),
        Some("noreply") => Ok(None),
        Some("error") => {
            let detail = reply
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("remote error")
                .to_owned();
            Err(match reply.get("kind").and_then(Value::as_str) {
                Some("unknown_handler") => RuntimeError::UnknownHandler(detail),
                Some("unknown_type") => RuntimeError::UnknownType(detail),
                Some("handler") => RuntimeError::Handler(Value::String(detail)),
                Some("persistence_failed") => RuntimeError::PersistenceFailed(detail),
                Some("load_failed") => RuntimeError::LoadFailed(detail),
                Some("schedule_failed") => RuntimeError::ScheduleFailed(detail),
                Some("timeout") => RuntimeError::Timeout,
                _ => RuntimeError::ActivationFailed(detail),
            })
        }
        _ => Err(RuntimeError::ActivationFailed(
            "malformed remote reply".to_owned(),
        )),
    }
}

fn encode_fire_reply(outcome: &FireOutcome) -> Value {
    match outcome {
        FireOutcome::Completed => json!({"status": "fire", "outcome": "completed"}),
        FireOutcome::NoHandler => json!({"status": "fire", "outcome": "no_handler"}),
        FireOutcome::PersistenceFailed(detail) => {
            json!({"status": "fire", "outcome": "persistence_failed", "detail": detail})
        }
        FireOutcome::Failed(detail) => {
            json!({"status": "fire", "outcome": "failed", "detail": detail})
        }
        FireOutcome::UnknownTarget => json!({"status": "fire", "outcome": "unknown_target"}),
    }
}

fn decode_fire_reply(reply: &Value) -> FireOutcome {
    let detail = || {
        reply
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    match reply.get("outcome").and_then(Value::as_str) {
        Some("completed") => FireOutcome::Completed,
        Some("no_handler") => FireOutcome::NoHandler,
        Some("persistence_failed") => FireOutcome::PersistenceFailed(detail()),
        Some("unknown_target") => FireOutcome::UnknownTarget,
        _ => FireOutcome::Failed(detail()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_replies_round_trip() {
        let ok = encode_invoke_reply(&Ok(Some(json!(5))));
        assert_eq!(decode_invoke_reply(&ok).unwrap(), Some(json!(5)));

        let noreply = encode_invoke_reply(&Ok(None));
        assert_eq!(decode_invoke_reply(&noreply).unwrap(), None);

        let err = encode_invoke_reply(&Err(RuntimeError::PersistenceFailed("disk".into())));
        assert!(matches!(
            decode_invoke_reply(&err),
            Err(RuntimeError::PersistenceFailed(_))
        ));
    }

    #[test]
    fn fire_replies_round_trip() {
        assert_eq!(
            decode_fire_reply(&encode_fire_reply(&FireOutcome::Completed)),
            FireOutcome::Completed
        );
        assert_eq!(
            decode_fire_reply(&encode_fire_reply(&FireOutcome::UnknownTarget)),
            FireOutcome::UnknownTarget
        );
        assert_eq!(
            decode_fire_reply(&encode_fire_reply(&FireOutcome::PersistenceFailed(
                "disk".into()
            ))),
            FireOutcome::PersistenceFailed("disk".into())
        );
    }
}
