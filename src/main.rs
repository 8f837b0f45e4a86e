use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use patternmesh::{DhtConfig, Keypair, NodeId, SimNetwork};

/// Run a simulated PatternMesh network: spawn nodes, join them, publish
/// pattern records and look them up from random nodes.
#[derive(Parser, Debug)]
#[command(name = "patternmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "64")]
    nodes: usize,

    #[arg(short, long, default_value = "16")]
    records: usize,

    #[arg(short, long, default_value_t = patternmesh::DEFAULT_K)]
    k: usize,

    #[arg(short, long, default_value_t = patternmesh::DEFAULT_ALPHA)]
    alpha: usize,

    /// Fraction of nodes taken offline after publishing.
    #[arg(long, default_value = "0.0")]
    offline: f64,

    /// Simulated one-way latency in milliseconds.
    #[arg(long, default_value = "0")]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        bail!("need at least two nodes");
    }
    if !(0.0..1.0).contains(&args.offline) {
        bail!("--offline must be in [0, 1)");
    }

    let config = DhtConfig {
        k: args.k,
        alpha: args.alpha,
        ..DhtConfig::default()
    };
    let net = SimNetwork::new();
    net.set_latency(std::time::Duration::from_millis(args.latency_ms)).await;

    let mut nodes = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        nodes.push(net.spawn_node(config.clone()).await?);
    }
    info!(nodes = nodes.len(), k = args.k, alpha = args.alpha, "network spawned");

    let seed = nodes[0].contact();
    for node in nodes.iter().skip(1) {
        if let Err(e) = node.bootstrap(vec![seed.clone()]).await {
            warn!(node = %node.node_id().short(), error = %e, "bootstrap failed");
        }
    }
    // Let the seed learn the rest of the network too.
    let _ = nodes[0].find_node(nodes[0].node_id()).await;

    let mut keys = Vec::with_capacity(args.records);
    for i in 0..args.records {
        let publisher = &nodes[i % nodes.len()];
        let creator = Keypair::generate();
        let payload = format!("pattern-{i}").into_bytes();
        match publisher.publish(payload, &creator).await {
            Ok(report) => {
                info!(key = %report.key.short(), acks = report.acks, targets = report.targets, "published");
                keys.push(report.key);
            }
            Err(e) => warn!(error = %e, "publish failed"),
        }
    }

    let offline = (args.nodes as f64 * args.offline) as usize;
    for node in nodes.iter().rev().take(offline) {
        net.set_offline(&node.node_id(), true).await;
    }
    if offline > 0 {
        info!(offline, "nodes taken offline");
    }

    let online = &nodes[..nodes.len() - offline];
    let mut found = 0;
    let mut total_rounds = 0;
    let started = Instant::now();
    for (i, key) in keys.iter().enumerate() {
        let reader = &online[(i * 7 + 3) % online.len()];
        match reader.lookup_with_deadline(*key, config.lookup_deadline).await {
            Ok((_, stats)) => {
                found += 1;
                total_rounds += stats.rounds;
            }
            Err(e) => warn!(key = %key.short(), error = %e, "lookup failed"),
        }
    }
    info!(
        found,
        published = keys.len(),
        avg_rounds = format!("{:.2}", total_rounds as f64 / found.max(1) as f64),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "lookups finished"
    );

    let sample = online
        .first()
        .context("no online node left")?
        .telemetry()
        .await;
    info!(
        routing_contacts = sample.routing_contacts,
        stored_records = sample.stored_records,
        published_records = sample.published_records,
        unhealthy_records = sample.unhealthy_records,
        "telemetry snapshot"
    );

    let requests = net.requests().await;
    let busiest = busiest_target(&requests);
    info!(
        requests = requests.len(),
        busiest = %busiest.map(|(id, _)| id.short()).unwrap_or_default(),
        busiest_count = busiest.map(|(_, n)| n).unwrap_or(0),
        "traffic summary"
    );

    net.shutdown().await;
    Ok(())
}

fn busiest_target(requests: &[patternmesh::SimRequest]) -> Option<(NodeId, usize)> {
    let mut counts = std::collections::HashMap::<NodeId, usize>::new();
    for request in requests {
        *counts.entry(request.to).or_default() += 1;
    }
    counts.into_iter().max_by_key(|(_, n)| *n)
}
