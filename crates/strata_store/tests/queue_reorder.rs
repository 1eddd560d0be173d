//! Failed fetches reorder the queue toward the merged result.

mod common;

use common::{no_merge_settings, wait_queue, Cluster, TABLE_PATH};
use strata_keeper::{CreateMode, Keeper};
use strata_store::{LogAction, LogEntry};

#[tokio::test]
async fn failed_fetch_lines_up_the_merge_first() {
    let cluster = Cluster::new();
    let r1 = cluster.open_with("r1", no_merge_settings()).await;
    let k = cluster.session();

    // Plant log entries about parts no replica serves: two fetches and the
    // merge consuming them.
    let p1 = "202607_0_0_0";
    let p2 = "202607_1_1_0";
    let p3 = "202607_0_1_1";
    let log_prefix = format!("{TABLE_PATH}/replicas/r1/log/log-");
    let get1 = LogEntry::get_part("r1", p1.parse().unwrap());
    let get2 = LogEntry::get_part("r1", p2.parse().unwrap());
    let merge = LogEntry::merge_parts(
        "r1",
        vec![p1.parse().unwrap(), p2.parse().unwrap()],
        p3.parse().unwrap(),
    );
    for entry in [&get1, &get2, &merge] {
        k.create(&log_prefix, &entry.to_text(), CreateMode::PersistentSequential)
            .await
            .unwrap();
    }

    // Queue cycles through failures; the post-reorder state has the merge
    // first, the surviving fetch next, and the failed fetch re-appended
    // last.
    let expected = vec![merge.clone(), get2.clone(), get1.clone()];
    wait_queue(&r1, "merge reordered ahead of its inputs", |snapshot| {
        snapshot == expected.as_slice()
    })
    .await;

    // Unobtainable parts are a normal condition, not a failure mode: the
    // entries stay queued and the table keeps serving.
    assert!(!r1.is_read_only());
    wait_queue(&r1, "all three entries survive", |snapshot| {
        snapshot.len() == 3
            && snapshot
                .iter()
                .any(|entry| matches!(entry.action, LogAction::MergeParts { .. }))
    })
    .await;

    r1.shutdown().await;
}
