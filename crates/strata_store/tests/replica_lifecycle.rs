//! Replica lifecycle: first startup, own-log no-ops, session loss, drop.

mod common;

use common::{
    block, eventually, no_merge_settings, part_names, wait_children_count, wait_node, wait_parts,
    Cluster, TABLE_PATH,
};
use strata_keeper::Keeper;

#[tokio::test]
async fn fresh_startup_creates_table_layout() {
    let cluster = Cluster::new();
    let table = cluster.open("r1").await;
    let k = cluster.session();

    let metadata = k.get(&format!("{TABLE_PATH}/metadata")).await.unwrap();
    assert_eq!(metadata, common::schema().to_text());

    for node in ["log", "queue", "parts", "log_pointers", "host"] {
        assert!(
            k.exists(&format!("{TABLE_PATH}/replicas/r1/{node}")).await.unwrap(),
            "missing replica node {node}"
        );
    }
    assert!(k
        .exists(&format!("{TABLE_PATH}/replicas/r1/is_active"))
        .await
        .unwrap());
    for node in ["blocks", "block_numbers", "leader_election", "temp"] {
        assert!(
            k.exists(&format!("{TABLE_PATH}/{node}")).await.unwrap(),
            "missing table node {node}"
        );
    }

    // The only replica becomes leader.
    eventually("r1 becomes leader", || table.is_leader()).await;

    table.shutdown().await;
    // Liveness is released with the session.
    wait_node(&k, &format!("{TABLE_PATH}/replicas/r1/is_active"), false).await;
}

#[tokio::test]
async fn own_insert_entries_resolve_without_refetch() {
    let cluster = Cluster::new();
    let table = cluster.open_with("r1", no_merge_settings()).await;
    let writer = table.writer().unwrap();
    for n in 0..3 {
        writer.write(block(n)).await.unwrap();
    }
    wait_parts(&table, &["202608_0_0_0", "202608_1_1_0", "202608_2_2_0"]).await;

    // The replica pulls its own insert entries, resolves them as no-ops
    // (the parts are already here), and clears the queue nodes.
    let k = cluster.session();
    wait_children_count(&k, &format!("{TABLE_PATH}/replicas/r1/queue"), 0).await;
    assert_eq!(part_names(&table).len(), 3);
    assert_eq!(table.read().len(), 3);

    table.shutdown().await;
}

#[tokio::test]
async fn session_loss_is_recovered_by_the_supervisor() {
    let cluster = Cluster::new();
    let table = cluster.open_with("r1", no_merge_settings()).await;
    let writer = table.writer().unwrap();
    writer.write(block(0)).await.unwrap();
    writer.write(block(1)).await.unwrap();
    wait_parts(&table, &["202608_0_0_0", "202608_1_1_0"]).await;

    let is_active = format!("{TABLE_PATH}/replicas/r1/is_active");
    let old_session = cluster
        .coordinator
        .session_owning(&is_active)
        .expect("replica is active");
    cluster.coordinator.expire_session(old_session);

    // The supervisor obtains a fresh session and re-activates the replica.
    eventually("replica re-activates on a new session", || {
        cluster
            .coordinator
            .session_owning(&is_active)
            .map(|owner| owner != old_session)
            .unwrap_or(false)
    })
    .await;
    assert!(!table.is_read_only());

    // Nothing was lost, and the table still accepts writes.
    wait_parts(&table, &["202608_0_0_0", "202608_1_1_0"]).await;
    writer.write(block(2)).await.unwrap();
    wait_parts(&table, &["202608_0_0_0", "202608_1_1_0", "202608_2_2_0"]).await;

    table.shutdown().await;
}

#[tokio::test]
async fn drop_removes_replica_then_table() {
    let cluster = Cluster::new();
    let r1 = cluster.open("r1").await;
    let r2 = cluster.open("r2").await;
    let k = cluster.session();

    r1.drop_table().await.unwrap();
    assert!(!k.exists(&format!("{TABLE_PATH}/replicas/r1")).await.unwrap());
    assert!(k.exists(TABLE_PATH).await.unwrap());

    r2.drop_table().await.unwrap();
    assert!(!k.exists(TABLE_PATH).await.unwrap());
}
