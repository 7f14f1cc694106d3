//! Stream Node simulation entry point.
//!
//! Runs a small overlay in-process: a set of nodes and trackers wired through
//! the memory transport, one publisher, and a delivery report at the end.

use anyhow::{Context, Result};
use clap::Parser;
use monas_stream_node::infrastructure::{MemoryNetwork, MemoryTracker, MemoryTrackerClient};
use monas_stream_node::{
    MessageId, MessageRef, Node, NodeConfig, NodeEvent, StreamMessage, StreamPartId,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::EnvFilter;

/// Stream Node CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "stream-node")]
#[command(about = "Monas Stream Node - in-process pub/sub overlay simulation")]
struct Args {
    /// Number of nodes to start.
    #[arg(short, long, default_value_t = 5)]
    nodes: usize,

    /// Number of trackers; streams are spread across them.
    #[arg(short, long, default_value_t = 1)]
    trackers: usize,

    /// Stream id every node subscribes to.
    #[arg(short, long, default_value = "demo-stream")]
    stream: String,

    /// Partitions of the stream.
    #[arg(short, long, default_value_t = 1)]
    partitions: u32,

    /// Messages published by the first node.
    #[arg(short, long, default_value_t = 10)]
    messages: u32,

    #[arg(long, default_value_t = 50)]
    publish_interval_ms: u64,

    /// Time given to the overlay to settle before and after publishing.
    #[arg(long, default_value_t = 500)]
    settle_ms: u64,

    /// JSON node configuration shared by every node.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Counts first-time deliveries per stream part until the channel closes.
fn count_deliveries(
    mut events: broadcast::Receiver<NodeEvent>,
    counts: Arc<Mutex<HashMap<StreamPartId, u64>>>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::UnseenMessageReceived { message, .. }) => {
                    *counts
                        .lock()
                        .await
                        .entry(message.stream_part().clone())
                        .or_insert(0) += 1;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Delivery counter lagged, missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let base_config = match &args.config {
        Some(path) => NodeConfig::from_json_file(path)?,
        None => NodeConfig::default(),
    };
    if args.nodes == 0 || args.trackers == 0 || args.partitions == 0 {
        anyhow::bail!("--nodes, --trackers and --partitions must be positive");
    }

    tracing::info!(
        "Starting simulation: {} nodes, {} trackers, stream {} with {} partitions",
        args.nodes,
        args.trackers,
        args.stream,
        args.partitions
    );

    let network = MemoryNetwork::new();
    let trackers: Vec<Arc<MemoryTracker>> = (0..args.trackers)
        .map(|i| MemoryTracker::new(format!("tracker-{i}")))
        .collect();
    let tracker_infos: Vec<_> = trackers.iter().map(|t| t.info().clone()).collect();

    let spids = (0..args.partitions)
        .map(|partition| StreamPartId::new(args.stream.clone(), partition))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid stream id")?;

    let mut nodes = Vec::with_capacity(args.nodes);
    let mut deliveries = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let node_id = format!("node-{i}");
        let config = NodeConfig {
            node_id: Some(node_id.clone()),
            trackers: tracker_infos.clone(),
            ..base_config.clone()
        };
        let node = Node::new(
            config,
            network.transport(node_id.clone()),
            MemoryTrackerClient::new(node_id, &trackers),
        );
        let counts = Arc::new(Mutex::new(HashMap::new()));
        count_deliveries(node.subscribe_events(), counts.clone());
        node.start();
        for spid in &spids {
            node.subscribe(spid)
                .await
                .with_context(|| format!("Failed to subscribe {} to {}", node.node_id(), spid))?;
        }
        nodes.push(node);
        deliveries.push(counts);
    }

    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;
    for node in &nodes {
        for spid in &spids {
            tracing::info!(
                "{} neighbors on {}: {:?}",
                node.node_id(),
                spid,
                node.get_neighbors(spid)
            );
        }
    }

    let publisher = &nodes[0];
    let mut last_refs: HashMap<StreamPartId, MessageRef> = HashMap::new();
    for seq in 0..args.messages {
        let spid = &spids[seq as usize % spids.len()];
        let message_id = MessageId::new(
            spid.clone(),
            now_millis(),
            seq,
            publisher.node_id(),
            "main",
        );
        let reference = message_id.message_ref();
        let message = StreamMessage::new(
            message_id,
            last_refs.insert(spid.clone(), reference),
            format!("message {seq}").into_bytes(),
        );
        let outcome = publisher.publish(message).await?;
        tracing::debug!("Published message {} on {}: {:?}", seq, spid, outcome);
        tokio::time::sleep(Duration::from_millis(args.publish_interval_ms)).await;
    }

    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;
    let expected_per_node = args.messages as u64;
    let mut complete = 0;
    for (node, counts) in nodes.iter().zip(&deliveries) {
        let received: u64 = counts.lock().await.values().sum();
        if received == expected_per_node {
            complete += 1;
        }
        tracing::info!(
            "{} received {}/{} messages",
            node.node_id(),
            received,
            expected_per_node
        );
    }
    tracing::info!("{}/{} nodes received every message", complete, nodes.len());
    match serde_json::to_string_pretty(&publisher.metrics_report()) {
        Ok(report) => tracing::info!("Publisher metrics:\n{}", report),
        Err(e) => tracing::warn!("Failed to serialize metrics: {}", e),
    }

    for node in &nodes {
        node.stop().await;
    }
    Ok(())
}
