//! Groupcast simulation binary.
//!
//! Fans one message out to a simulated group over the in-memory peer
//! transport and logs the outcome. Useful for eyeballing strategy choice,
//! relay load and failure counts at a given size and drop rate.
//!
//! # Usage
//!
//! ```bash
//! # 50k members, default tree fanout and cluster size
//! groupcast-sim --members 50000
//!
//! # Lossy network, two retry passes, then backfill 10k messages to a newcomer
//! groupcast-sim --members 5000 --drop-rate 0.05 --retries 2 --backlog 10000
//! ```

use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use groupcast_core::{DistributionStatus, DistributorConfig, GroupId};
use groupcast_harness::{FaultInjector, Fixture, PeerTransport, chat, users};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Simulated group fan-out
#[derive(Parser, Debug)]
#[command(name = "groupcast-sim")]
#[command(about = "Run one simulated group distribution")]
#[command(version)]
struct Args {
    /// Group size, sender included
    #[arg(short, long, default_value = "1000")]
    members: usize,

    /// Message to distribute
    #[arg(long, default_value = "hello, group")]
    message: String,

    /// Children per relay in tree and mesh routing
    #[arg(long, default_value = "8")]
    fanout: usize,

    /// Members per mesh cluster
    #[arg(long, default_value = "1000")]
    cluster_size: usize,

    /// Probability that any single send is dropped
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Retry passes over failed recipients
    #[arg(long, default_value = "0")]
    retries: usize,

    /// Backlog size to sync to a member joining after the send
    #[arg(long, default_value = "0")]
    backlog: usize,

    /// Seed for keys, ids and dropped sends
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if args.members == 0 {
        return Err("group needs at least one member".into());
    }

    let transport = PeerTransport::with_faults(FaultInjector::with_seed(args.seed));
    transport.faults().set_drop_rate(args.drop_rate);
    let config = DistributorConfig {
        tree_fanout: args.fanout,
        mesh_cluster_size: args.cluster_size,
        ..Default::default()
    };
    let fixture = Fixture::build(args.seed, transport, None, config);

    let group = GroupId::from("sim");
    let mut members = users("member", args.members);
    let sender = members[0].clone();
    fixture.encryption.initialize_group_encryption(&group, &[sender.clone()], &sender).await?;
    fixture.chats.insert(chat(group.as_str(), members.clone()));

    tracing::info!(
        members = args.members,
        strategy = %fixture.distributor.optimal_distribution_strategy(args.members),
        seed = args.seed,
        "Simulation starting"
    );

    let started = Instant::now();
    let mut result = fixture
        .distributor
        .distribute_message(&group, Bytes::from(args.message.clone()), &sender)
        .await?;

    for pass in 1..=args.retries {
        if result.failed_deliveries == 0 {
            break;
        }
        tracing::info!(pass, failed = result.failed_deliveries, "Retrying failed recipients");
        result = fixture.distributor.retry_failed_deliveries(result.distribution_id).await?;
    }
    let elapsed = started.elapsed();

    tracing::info!(
        distribution_id = %result.distribution_id,
        strategy = %result.strategy,
        completed = result.status == DistributionStatus::Completed,
        successful = result.successful_deliveries,
        failed = result.failed_deliveries,
        direct_sends = fixture.transport.direct(),
        relayed_sends = fixture.transport.relayed(),
        max_relay_load = fixture.transport.max_relay_load(),
        max_hop = fixture.transport.max_hop(),
        dropped = fixture.transport.faults().dropped(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Distribution finished"
    );

    if args.backlog > 0 {
        fixture.messages.seed_backlog(&group, &sender, args.backlog);
        let newcomer = groupcast_core::UserId::from("newcomer");
        members.push(newcomer.clone());
        fixture.chats.insert(chat(group.as_str(), members));

        let started = Instant::now();
        let sync = fixture.history.synchronize_history_for_new_member(&group, &newcomer).await?;
        tracing::info!(
            messages = sync.messages_synced,
            pages = sync.pages_fetched,
            truncated = sync.truncated,
            largest_read = fixture.messages.largest_read(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "History sync finished"
        );
    }

    Ok(())
}
