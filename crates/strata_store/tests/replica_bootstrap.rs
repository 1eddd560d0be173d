//! New-replica bootstrap from a reference peer.

mod common;

use common::{block, no_merge_settings, part_names, wait_parts, wait_value, Cluster, TABLE_PATH};
use strata_keeper::Keeper;

#[tokio::test]
async fn second_replica_mimics_the_first() {
    let cluster = Cluster::new();
    let r1 = cluster.open_with("r1", no_merge_settings()).await;
    let writer = r1.writer().unwrap();
    writer.write(block(0)).await.unwrap();
    writer.write(block(1)).await.unwrap();
    wait_parts(&r1, &["202608_0_0_0", "202608_1_1_0"]).await;

    // Let r1 absorb its own two insert entries so the pointer r2 copies is
    // settled.
    let k = cluster.session();
    let r1_own_pointer = format!("{TABLE_PATH}/replicas/r1/log_pointers/r1");
    wait_value(&k, &r1_own_pointer, "2").await;

    let r2 = cluster.open_with("r2", no_merge_settings()).await;

    // r1 acknowledged r2 by creating a pointer into its (empty) log.
    assert!(k
        .exists(&format!("{TABLE_PATH}/replicas/r1/log_pointers/r2"))
        .await
        .unwrap());

    // r2 inherited r1's view of r1's log progress verbatim, so it will not
    // re-pull the insert entries it fetched the parts for.
    let copied = k
        .get(&format!("{TABLE_PATH}/replicas/r2/log_pointers/r1"))
        .await
        .unwrap();
    assert_eq!(copied, "2");

    // The queued fetches bring over both parts.
    wait_parts(&r2, &["202608_0_0_0", "202608_1_1_0"]).await;
    assert_eq!(part_names(&r1), part_names(&r2));

    r2.shutdown().await;
    r1.shutdown().await;
}

#[tokio::test]
async fn bootstrap_fetches_the_maximal_cover_only() {
    let cluster = Cluster::new();
    // Merges allowed: r1 compacts its inserts into one covering part. The
    // merge cascade shape varies, so wait on the covered range, not a name.
    let r1 = cluster.open("r1").await;
    let writer = r1.writer().unwrap();
    for n in 0..4 {
        writer.write(block(n)).await.unwrap();
    }
    common::eventually("r1 compacts to one part covering 0..3", || {
        let parts = r1.local_parts();
        parts.len() == 1 && parts[0].name.left == 0 && parts[0].name.right == 3
    })
    .await;
    let cover = r1.local_parts()[0].name.to_string();

    let r2 = cluster.open("r2").await;
    wait_parts(&r2, &[&cover]).await;

    r2.shutdown().await;
    r1.shutdown().await;
}
