use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use runtime::{
    Catalog, KindSpec, Location, Outcome, RegistryMode, Runtime, RuntimeConfig,
};
use store::{Database, ObjectStore, SqlStore, migrate};

async fn shared_db() -> Result<Database> {
    let conn = sea_orm::Database::connect("sqlite::memory:").await?;
    let db = Database::from_connection(conn);
    migrate(db.connection(), None, 0).await?;
    Ok(db)
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
        .build()
        .expect("counter kind")
}

async fn start_node(db: &Database) -> Result<Runtime> {
    let store: Arc<dyn ObjectStore> = Arc::new(SqlStore::new(db.clone()));
    let cfg = RuntimeConfig {
        store: Some(store),
        database: Some(db.clone()),
        registry_mode: RegistryMode::Distributed,
        run_poller: false,
        node_ttl: Duration::from_millis(600),
        call_poll_interval: Duration::from_millis(20),
        ..RuntimeConfig::default()
    };
    Ok(Runtime::start(cfg, Catalog::new().with(counter_kind())).await?)
}

#[tokio::test]
async fn remote_invocations_route_to_the_owning_node() -> Result<()> {
    let db = shared_db().await?;
    let node_a = start_node(&db).await?;
    let node_b = start_node(&db).await?;

    // First touch places the entity on node A.
    assert_eq!(
        node_a.invoke("counter", "x", "increment", vec![json!(5)]).await?,
        Some(json!(5))
    );
    assert_eq!(
        node_a.locate("counter", "x").await?,
        Some(Location::Local)
    );

    // Node B reaches the same instance through the call table.
    assert_eq!(
        node_b.invoke("counter", "x", "increment", vec![json!(1)]).await?,
        Some(json!(6))
    );
    assert_eq!(
        node_b.locate("counter", "x").await?,
        Some(Location::Node(node_a.node_id().to_owned()))
    );

    node_b.shutdown().await;
    node_a.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn placements_migrate_after_node_loss() -> Result<()> {
    let db = shared_db().await?;
    let node_a = start_node(&db).await?;
    let node_b = start_node(&db).await?;

    assert_eq!(
        node_a.invoke("counter", "y", "increment", vec![json!(5)]).await?,
        Some(json!(5))
    );

    // Node A leaves the cluster; its heartbeat row goes with it.
    node_a.shutdown().await;

    // The next call from the survivor steals the placement and reactivates
    // the entity from its persisted state.
    assert_eq!(
        node_b.invoke("counter", "y", "increment", vec![json!(1)]).await?,
        Some(json!(6))
    );
    assert_eq!(node_b.locate("counter", "y").await?, Some(Location::Local));

    node_b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn two_nodes_agree_on_a_single_placement() -> Result<()> {
    let db = shared_db().await?;
    let node_a = start_node(&db).await?;
    let node_b = start_node(&db).await?;

    // Both nodes race to activate the same entity.
    let (ra, rb) = tokio::join!(
        node_a.invoke("counter", "z", "increment", vec![json!(1)]),
        node_b.invoke("counter", "z", "increment", vec![json!(1)])
    );
    ra?;
    rb?;

    // Exactly one node hosts it; both see the same total.
    let a_local = node_a.locate("counter", "z").await? == Some(Location::Local);
    let b_local = node_b.locate("counter", "z").await? == Some(Location::Local);
    assert!(a_local ^ b_local, "exactly one node must host the entity");

    assert_eq!(
        node_a.invoke("counter", "z", "get", vec![]).await?,
        Some(json!(2))
    );
    assert_eq!(
        node_b.invoke("counter", "z", "get", vec![]).await?,
        Some(json!(2))
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
    Ok(())
}
