// Demo node: an in-process cluster of replicas over one in-memory
// coordinator. Writes flow through the first replica; replication and merge
// selection run in the background; the final part sets are printed per
// replica.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use strata_keeper::MemoryCoordinator;
use strata_store::{
    BackgroundPool, Block, ReplicatedTable, ReplicationSettings, TableConfig, TableSchema,
};

#[derive(Parser, Debug)]
#[command(name = "strata-node", about = "In-process replicated table demo")]
struct Args {
    /// Number of replicas to run.
    #[arg(long, default_value_t = 3)]
    replicas: usize,
    /// Number of blocks to insert.
    #[arg(long, default_value_t = 12)]
    blocks: usize,
    /// Month bucket for the inserted blocks.
    #[arg(long, default_value = "202608")]
    month: String,
    /// Data directory; a temporary one is used when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// How long to let replication and merging settle.
    #[arg(long, default_value_t = 3)]
    settle_secs: u64,
}

fn demo_schema() -> TableSchema {
    TableSchema {
        date_column: "EventDate".into(),
        sampling_expression: String::new(),
        index_granularity: 8192,
        mode: 0,
        sign_column: String::new(),
        primary_key: "(EventDate)".into(),
        columns: vec![
            ("EventDate".into(), "Date".into()),
            ("Value".into(), "UInt64".into()),
        ],
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.data_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("strata-demo-{}", std::process::id()))
    });

    let coordinator = MemoryCoordinator::new();
    let pool = BackgroundPool::start(4);
    let settings = ReplicationSettings {
        queue_update_period: Duration::from_millis(200),
        merge_selecting_period: Duration::from_millis(200),
        old_parts_lifetime: Duration::from_secs(1),
        ..ReplicationSettings::default()
    };

    let mut tables = Vec::new();
    for index in 1..=args.replicas.max(1) {
        let replica = format!("r{index}");
        let config = TableConfig {
            coordinator_path: "/demo/visits".into(),
            replica_name: replica.clone(),
            host: "local".into(),
            port: 9000 + index as u16,
            data_dir: data_dir.join(&replica),
            schema: demo_schema(),
            settings: settings.clone(),
            attach: false,
        };
        let table = ReplicatedTable::open(config, Arc::new(coordinator.clone()), pool.clone())
            .await
            .with_context(|| format!("open replica {replica}"))?;
        tracing::info!(replica = %replica, "replica up");
        tables.push(table);
    }

    let writer = tables[0].writer().context("open writer")?;
    for n in 0..args.blocks {
        writer
            .write(Block {
                month: args.month.clone(),
                rows: 64,
                payload: Bytes::from(format!("block-{n}")),
                insert_id: Some(format!("demo-insert-{n}")),
            })
            .await
            .with_context(|| format!("insert block {n}"))?;
    }
    tracing::info!(blocks = args.blocks, "inserted");

    tokio::time::sleep(Duration::from_secs(args.settle_secs)).await;

    for table in &tables {
        let parts: Vec<String> = table
            .local_parts()
            .iter()
            .map(|part| format!("{} ({} rows)", part.name, part.rows))
            .collect();
        println!("{}: {}", table.replica_name(), parts.join(", "));
    }

    for table in tables {
        table.shutdown().await;
    }
    pool.shutdown().await;
    Ok(())
}
