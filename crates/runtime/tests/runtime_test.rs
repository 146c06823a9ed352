use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use runtime::{
    AfterLoad, AlarmDirective, AlarmOutcome, Catalog, KindSpec, Outcome, Runtime, RuntimeConfig,
    RuntimeError, StopReason,
};
use store::{
    Database, EntityKey, KeyPolicy, ObjectStore, ObjectRecord, SqlStore, StateDoc, StoreError,
    migrate,
};

async fn test_db() -> Result<Database> {
    let conn = sea_orm::Database::connect("sqlite::memory:").await?;
    let db = Database::from_connection(conn);
    migrate(db.connection(), None, 0).await?;
    Ok(db)
}

fn doc(v: Value) -> StateDoc {
    match v {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn counter_kind() -> KindSpec {
    KindSpec::builder("counter")
        .field("count", json!(0))
        .handler("increment", 1, |args, view| async move {
            let n = args[0].as_i64().unwrap_or(0);
            let total = view.get_i64("count") + n;
            let mut state = view.into_state();
            state.insert("count".to_owned(), json!(total));
            Outcome::ReplyWith(json!(total), state)
        })
        .handler("get", 0, |_args, view| async move {
            Outcome::Reply(json!(view.get_i64("count")))
        })
        .handler("touch", 0, |_args, view| async move {
            // Returns the state unchanged; no write should happen.
            let state = view.into_state();
            Outcome::ReplyWith(json!("touched"), state)
        })
        .handler("fail", 0, |_args, _view| async move {
            Outcome::Fail(json!("boom"))
        })
        .build()
        .expect("counter kind")
}

fn config(db: &Database, store: Arc<dyn ObjectStore>) -> RuntimeConfig {
    RuntimeConfig {
        store: Some(store),
        database: Some(db.clone()),
        run_poller: false,
        ..RuntimeConfig::default()
    }
}

async fn start_counter_runtime(db: &Database) -> Result<(Runtime, Arc<SqlStore>)> {
    let store = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(
        config(db, store.clone()),
        Catalog::new().with(counter_kind()),
    )
    .await?;
    Ok((rt, store))
}

#[tokio::test]
async fn counter_lifecycle_survives_a_restart() -> Result<()> {
    let db = test_db().await?;

    let (rt, _store) = start_counter_runtime(&db).await?;
    let reply = rt.invoke("counter", "c1", "increment", vec![json!(5)]).await?;
    assert_eq!(reply, Some(json!(5)));
    rt.shutdown().await;

    // A fresh runtime over the same database sees the persisted count.
    let (rt, _store) = start_counter_runtime(&db).await?;
    let reply = rt.invoke("counter", "c1", "get", vec![]).await?;
    assert_eq!(reply, Some(json!(5)));
    rt.shutdown().await;
    Ok(())
}

/// Store wrapper that rejects the next save on request.
struct FailingStore {
    inner: SqlStore,
    fail_next: AtomicBool,
}

#[async_trait]
impl ObjectStore for FailingStore {
    async fn load(
        &self,
        key: &EntityKey,
        prefix: Option<&str>,
    ) -> store::Result<Option<ObjectRecord>> {
        self.inner.load(key, prefix).await
    }

    async fn save(
        &self,
        key: &EntityKey,
        state: &StateDoc,
        prefix: Option<&str>,
    ) -> store::Result<ObjectRecord> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Save(sea_orm::DbErr::Custom(
                "injected write failure".to_owned(),
            )));
        }
        self.inner.save(key, state, prefix).await
    }

    async fn delete(&self, key: &EntityKey, prefix: Option<&str>) -> store::Result<()> {
        self.inner.delete(key, prefix).await
    }

    fn stats(&self) -> &store::StoreStats {
        self.inner.stats()
    }
}

#[tokio::test]
async fn rejected_write_rolls_back_everywhere() -> Result<()> {
    let db = test_db().await?;
    let failing = Arc::new(FailingStore {
        inner: SqlStore::new(db.clone()),
        fail_next: AtomicBool::new(false),
    });
    let rt = Runtime::start(
        config(&db, failing.clone()),
        Catalog::new().with(counter_kind()),
    )
    .await?;

    // Activate and seed count 0.
    assert_eq!(rt.invoke("counter", "r1", "get", vec![]).await?, Some(json!(0)));

    failing.fail_next.store(true, Ordering::SeqCst);
    let err = rt
        .invoke("counter", "r1", "increment", vec![json!(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::PersistenceFailed(_)));

    // Both the live state and the stored row read the pre-handler value.
    assert_eq!(rt.invoke("counter", "r1", "get", vec![]).await?, Some(json!(0)));
    let plain = SqlStore::new(db.clone());
    let row = plain
        .load(&EntityKey::new("counter", "r1"), None)
        .await?
        .expect("row exists");
    assert_eq!(row.state, doc(json!({"count": 0})));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unchanged_state_skips_the_store() -> Result<()> {
    let db = test_db().await?;
    let (rt, store) = start_counter_runtime(&db).await?;

    rt.invoke("counter", "s1", "increment", vec![json!(2)]).await?;
    let saves_before = store.stats().saves();

    assert_eq!(
        rt.invoke("counter", "s1", "touch", vec![]).await?,
        Some(json!("touched"))
    );
    assert_eq!(store.stats().saves(), saves_before);

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invocations_serialize_per_entity() -> Result<()> {
    let db = test_db().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));

    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlap_seen = Arc::new(AtomicBool::new(false));
    let in_flight_h = in_flight.clone();
    let overlap_h = overlap_seen.clone();

    let kind = KindSpec::builder("counter")
        .field("count", json!(0))
        .handler("increment", 1, move |args, view| {
            let in_flight = in_flight_h.clone();
            let overlap = overlap_h.clone();
            async move {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                let n = args[0].as_i64().unwrap_or(0);
                let total = view.get_i64("count") + n;
                let mut state = view.into_state();
                state.insert("count".to_owned(), json!(total));
                Outcome::ReplyWith(json!(total), state)
            }
        })
        .handler("get", 0, |_args, view| async move {
            Outcome::Reply(json!(view.get_i64("count")))
        })
        .build()
        .expect("kind");

    let rt = Runtime::start(config(&db, store), Catalog::new().with(kind)).await?;

    let mut joins = Vec::new();
    for _ in 0..40 {
        let rt = rt.clone();
        joins.push(tokio::spawn(async move {
            rt.invoke("counter", "p1", "increment", vec![json!(1)]).await
        }));
    }
    for join in joins {
        join.await??;
    }

    // One instance, strictly serial handling, nothing lost.
    assert!(!overlap_seen.load(Ordering::SeqCst));
    assert_eq!(
        rt.invoke("counter", "p1", "get", vec![]).await?,
        Some(json!(40))
    );

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_handlers_and_wrong_arity_are_rejected() -> Result<()> {
    let db = test_db().await?;
    let (rt, _store) = start_counter_runtime(&db).await?;

    let err = rt
        .invoke("counter", "u1", "nope", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownHandler(name) if name == "nope"));

    // Wrong arity resolves to no callable either.
    let err = rt
        .invoke("counter", "u1", "increment", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownHandler(_)));

    let err = rt
        .invoke("ghost_kind", "u1", "get", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownType(_)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handler_failure_leaves_state_untouched() -> Result<()> {
    let db = test_db().await?;
    let (rt, _store) = start_counter_runtime(&db).await?;

    rt.invoke("counter", "f1", "increment", vec![json!(3)]).await?;
    let err = rt.invoke("counter", "f1", "fail", vec![]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Handler(cause) if cause == json!("boom")));
    assert_eq!(rt.invoke("counter", "f1", "get", vec![]).await?, Some(json!(3)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn idle_instances_shut_down_and_reactivate() -> Result<()> {
    let db = test_db().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let mut cfg = config(&db, store);
    cfg.shutdown_after = Some(Duration::from_millis(50));
    let rt = Runtime::start(cfg, Catalog::new().with(counter_kind())).await?;

    rt.invoke("counter", "i1", "increment", vec![json!(7)]).await?;
    assert!(rt.locate("counter", "i1").await?.is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(rt.locate("counter", "i1").await?.is_none());

    // The next call reactivates from the persisted state.
    assert_eq!(rt.invoke("counter", "i1", "get", vec![]).await?, Some(json!(7)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn explicit_deactivate_stops_the_instance() -> Result<()> {
    let db = test_db().await?;
    let (rt, _store) = start_counter_runtime(&db).await?;

    rt.invoke("counter", "d1", "increment", vec![json!(1)]).await?;
    assert!(rt.deactivate("counter", "d1", StopReason::Normal).await?);
    assert!(rt.locate("counter", "d1").await?.is_none());
    // Deactivating a dead entity reports false.
    assert!(!rt.deactivate("counter", "d1", StopReason::Normal).await?);

    assert_eq!(rt.invoke("counter", "d1", "get", vec![]).await?, Some(json!(1)));
    rt.shutdown().await;
    Ok(())
}

fn ticking_kind() -> KindSpec {
    KindSpec::builder("ticker")
        .field("ticks", json!(0))
        .alarm("tick")
        .handler("get", 0, |_args, view| async move {
            Outcome::Reply(json!(view.get_i64("ticks")))
        })
        .on_alarm(|name, view| async move {
            let total = view.get_i64("ticks") + 1;
            let mut state = view.into_state();
            state.insert("ticks".to_owned(), json!(total));
            AlarmOutcome::UpdateWithAlarm(
                state,
                AlarmDirective::new(name.as_str(), Duration::from_millis(50)),
            )
        })
        .build()
        .expect("ticker kind")
}

#[tokio::test]
async fn recurring_alarm_keeps_one_row_and_ticks() -> Result<()> {
    let db = test_db().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(ticking_kind())).await?;

    rt.schedule_alarm("ticker", "t1", "tick", Duration::ZERO).await?;

    // Drive the poller by hand so the cadence is deterministic.
    let poll = rt.poll_scheduler().expect("poll backend");
    let sink = rt.alarm_sink();
    for _ in 0..6 {
        poll.poll_once(sink.as_ref()).await?;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let pending = rt.list_alarms("ticker", "t1").await?;
    assert_eq!(pending.len(), 1, "reschedule keeps exactly one row");

    let ticks = rt
        .invoke("ticker", "t1", "get", vec![])
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    assert!(ticks >= 4, "expected at least 4 ticks, got {ticks}");

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn durable_alarms_survive_a_runtime_restart() -> Result<()> {
    let db = test_db().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(ticking_kind())).await?;
    rt.schedule_alarm("ticker", "rs1", "tick", Duration::ZERO).await?;
    rt.shutdown().await;

    // The alarm row outlives the runtime; the declared alarm name lets the
    // next run resolve and fire it.
    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(ticking_kind())).await?;
    let poll = rt.poll_scheduler().expect("poll backend");
    poll.poll_once(rt.alarm_sink().as_ref()).await?;

    let ticks = rt
        .invoke("ticker", "rs1", "get", vec![])
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    assert!(ticks >= 1, "expected the restored alarm to tick, got {ticks}");

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn alarm_without_handler_is_retired_quietly() -> Result<()> {
    let db = test_db().await?;
    let (rt, _store) = start_counter_runtime(&db).await?;

    rt.schedule_alarm("counter", "n1", "ping", Duration::ZERO).await?;
    let poll = rt.poll_scheduler().expect("poll backend");
    let sweep = poll.poll_once(rt.alarm_sink().as_ref()).await?;

    assert_eq!(sweep.retired, 1);
    assert!(rt.list_alarms("counter", "n1").await?.is_empty());

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn forward_compatible_load_drops_unknown_keys() -> Result<()> {
    let db = test_db().await?;
    let seed = SqlStore::new(db.clone());

    // A row written by an older schema with an extra field and a missing
    // declared one.
    seed.save(
        &EntityKey::new("counter", "fc1"),
        &doc(json!({"count": 2, "legacy_field": 7})),
        None,
    )
    .await?;

    let (rt, _store) = start_counter_runtime(&db).await?;
    assert_eq!(rt.invoke("counter", "fc1", "get", vec![]).await?, Some(json!(2)));

    // Any write back carries only declared fields.
    rt.invoke("counter", "fc1", "increment", vec![json!(1)]).await?;
    let row = seed
        .load(&EntityKey::new("counter", "fc1"), None)
        .await?
        .expect("row exists");
    assert_eq!(row.state, doc(json!({"count": 3})));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_declared_fields_adopt_their_defaults() -> Result<()> {
    let db = test_db().await?;
    let seed = SqlStore::new(db.clone());
    seed.save(&EntityKey::new("labelled", "m1"), &doc(json!({"count": 4})), None)
        .await?;

    // The schema grew a field after the row was written.
    let kind = KindSpec::builder("labelled")
        .field("count", json!(0))
        .field("label", json!("fresh"))
        .handler("label", 0, |_args, view| async move {
            Outcome::Reply(view.get("label").cloned().unwrap_or(json!(null)))
        })
        .build()
        .expect("kind");

    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(kind)).await?;

    assert_eq!(
        rt.invoke("labelled", "m1", "label", vec![]).await?,
        Some(json!("fresh"))
    );
    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn existing_symbols_policy_fails_activation_on_unknown_keys() -> Result<()> {
    let db = test_db().await?;
    let seed = SqlStore::new(db.clone());
    seed.save(
        &EntityKey::new("vault", "v1"),
        &doc(json!({"data": {"never_interned_nested_key_zq": 1}})),
        None,
    )
    .await?;

    let kind = KindSpec::builder("vault")
        .field("data", json!({}))
        .object_keys(KeyPolicy::ExistingSymbols)
        .handler("get", 0, |_args, view| async move {
            Outcome::Reply(view.get("data").cloned().unwrap_or(json!(null)))
        })
        .build()
        .expect("kind");

    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(kind)).await?;

    let err = rt.invoke("vault", "v1", "get", vec![]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::LoadFailed(_)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn after_load_runs_once_and_may_schedule() -> Result<()> {
    let db = test_db().await?;

    let kind = KindSpec::builder("session")
        .field("visits", json!(0))
        .handler("visits", 0, |_args, view| async move {
            Outcome::Reply(json!(view.get_i64("visits")))
        })
        .after_load(|mut state| async move {
            let visits = state.get("visits").and_then(Value::as_i64).unwrap_or(0) + 1;
            state.insert("visits".to_owned(), json!(visits));
            Ok(AfterLoad::with_alarm(
                state,
                AlarmDirective::new("expire", Duration::from_secs(300)),
            ))
        })
        .build()
        .expect("kind");

    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(kind)).await?;

    // The hook ran during activation, its state change persisted, and the
    // alarm it asked for is pending.
    assert_eq!(rt.invoke("session", "a1", "visits", vec![]).await?, Some(json!(1)));
    assert_eq!(rt.invoke("session", "a1", "visits", vec![]).await?, Some(json!(1)));
    let pending = rt.list_alarms("session", "a1").await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "expire");

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handlers_see_the_entity_id_read_only() -> Result<()> {
    let db = test_db().await?;

    let kind = KindSpec::builder("mirror")
        .field("noise", json!(null))
        .handler("whoami", 0, |_args, view| async move {
            Outcome::Reply(json!(view.id()))
        })
        .build()
        .expect("kind");

    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(kind)).await?;

    assert_eq!(
        rt.invoke("mirror", "xyz-42", "whoami", vec![]).await?,
        Some(json!("xyz-42"))
    );

    // The id is injected, not persisted.
    let row = SqlStore::new(db.clone())
        .load(&EntityKey::new("mirror", "xyz-42"), None)
        .await?
        .expect("row exists");
    assert!(!row.state.contains_key("id"));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn caller_deadline_does_not_cancel_the_mutation() -> Result<()> {
    let db = test_db().await?;

    let kind = KindSpec::builder("slowpoke")
        .field("count", json!(0))
        .handler("slow_increment", 0, |_args, view| async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let total = view.get_i64("count") + 1;
            let mut state = view.into_state();
            state.insert("count".to_owned(), json!(total));
            Outcome::Update(state)
        })
        .handler("get", 0, |_args, view| async move {
            Outcome::Reply(json!(view.get_i64("count")))
        })
        .build()
        .expect("kind");

    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let rt = Runtime::start(config(&db, store), Catalog::new().with(kind)).await?;

    let err = rt
        .invoke_with_deadline(
            "slowpoke",
            "w1",
            "slow_increment",
            vec![],
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout));

    // The handler still finished and persisted after the caller left.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rt.invoke("slowpoke", "w1", "get", vec![]).await?, Some(json!(1)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn store_less_runtime_works_in_memory() -> Result<()> {
    let rt = Runtime::start(
        RuntimeConfig::default(),
        Catalog::new().with(counter_kind()).with(ticking_kind()),
    )
    .await?;

    assert_eq!(
        rt.invoke("counter", "m1", "increment", vec![json!(2)]).await?,
        Some(json!(2))
    );
    assert_eq!(rt.invoke("counter", "m1", "get", vec![]).await?, Some(json!(2)));

    // Alarms run through the in-memory scheduler.
    rt.schedule_alarm("ticker", "m2", "tick", Duration::from_millis(20))
        .await?;
    tokio::time::sleep(Duration::from_millis(250)).await;
    let ticks = rt
        .invoke("ticker", "m2", "get", vec![])
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    assert!(ticks >= 1, "expected in-memory ticks, got {ticks}");

    rt.shutdown().await;
    Ok(())
}
