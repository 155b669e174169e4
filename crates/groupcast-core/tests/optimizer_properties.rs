//! Property-based tests for `MessageDeliveryOptimizer`
//!
//! Ordering must be a permutation of its input, batch sizes must stay in
//! range and respond to conditions in the right direction, and rate limits
//! must never stall a sender.

use std::{collections::HashSet, time::Duration};

use groupcast_core::{MessageDeliveryOptimizer, NetworkConditions, OptimizerConfig, UserId};
use groupcast_harness::users;
use proptest::prelude::*;

fn conditions() -> impl Strategy<Value = NetworkConditions> {
    (0.0f64..100_000.0, 0.0f64..500.0, 0.0f64..=1.0, 0.0f64..=1.0, 0usize..10_000).prop_map(
        |(bandwidth_kbps, latency_ms, packet_loss, connection_stability, peer_count)| {
            NetworkConditions {
                bandwidth_kbps,
                latency_ms,
                packet_loss,
                connection_stability,
                peer_count,
            }
        },
    )
}

#[test]
fn ordering_fifty_thousand_recipients_is_fast() {
    let optimizer = MessageDeliveryOptimizer::default();
    let recipients = users("u", 50_000);
    for (i, user) in recipients.iter().enumerate().step_by(3) {
        optimizer.record_peer_metrics(user, Duration::from_millis((i % 500) as u64), i % 7 != 0);
    }

    let started = std::time::Instant::now();
    let ordered = optimizer.optimize_delivery_order(&recipients, b"payload");
    let elapsed = started.elapsed();

    assert_eq!(ordered.len(), recipients.len());
    assert!(elapsed < Duration::from_secs(5), "ordering took {elapsed:?}");
}

#[test]
fn known_fast_peers_come_first() {
    let optimizer = MessageDeliveryOptimizer::default();
    let recipients = users("u", 6);
    optimizer.record_peer_metrics(&recipients[4], Duration::from_millis(5), true);
    optimizer.record_peer_metrics(&recipients[2], Duration::from_millis(50), true);
    optimizer.record_peer_metrics(&recipients[0], Duration::from_millis(1), false);

    let ordered = optimizer.optimize_delivery_order(&recipients, b"");

    let expected: Vec<UserId> = [4, 2, 1, 3, 5, 0].iter().map(|&i| recipients[i].clone()).collect();
    assert_eq!(ordered, expected);
}

#[test]
fn tracked_peer_cap_is_respected() {
    let optimizer =
        MessageDeliveryOptimizer::new(OptimizerConfig { max_tracked_peers: 2, ..Default::default() });
    let peers = users("p", 3);
    for peer in &peers {
        optimizer.record_peer_metrics(peer, Duration::from_millis(10), true);
    }
    assert!(optimizer.peer_metrics(&peers[2]).is_none());

    optimizer.record_peer_metrics(&peers[0], Duration::from_millis(99), false);
    let updated = optimizer.peer_metrics(&peers[0]).unwrap();
    assert_eq!(updated.latency, Duration::from_millis(99));
    assert!(!updated.connected);
}

proptest! {
    /// Property: ordering returns exactly the input recipients
    #[test]
    fn prop_order_is_permutation(
        count in 0usize..300,
        known in prop::collection::vec((0usize..300, 0u64..1000, any::<bool>()), 0..100),
    ) {
        let optimizer = MessageDeliveryOptimizer::default();
        let recipients = users("u", count);
        for (index, latency, connected) in known {
            if let Some(user) = recipients.get(index) {
                optimizer.record_peer_metrics(user, Duration::from_millis(latency), connected);
            }
        }

        let ordered = optimizer.optimize_delivery_order(&recipients, b"m");

        prop_assert_eq!(ordered.len(), recipients.len());
        let ordered_set: HashSet<&UserId> = ordered.iter().collect();
        let input_set: HashSet<&UserId> = recipients.iter().collect();
        prop_assert_eq!(ordered_set, input_set);
    }

    /// Property: connected peers precede unknown peers, which precede
    /// disconnected peers
    #[test]
    fn prop_connected_peers_lead(
        count in 1usize..200,
        known in prop::collection::vec((0usize..200, 0u64..1000, any::<bool>()), 0..80),
    ) {
        let optimizer = MessageDeliveryOptimizer::default();
        let recipients = users("u", count);
        for (index, latency, connected) in known {
            if let Some(user) = recipients.get(index) {
                optimizer.record_peer_metrics(user, Duration::from_millis(latency), connected);
            }
        }

        let rank = |user: &UserId| match optimizer.peer_metrics(user) {
            Some(metrics) if metrics.connected => 0,
            None => 1,
            Some(_) => 2,
        };
        let ranks: Vec<u8> =
            optimizer.optimize_delivery_order(&recipients, b"m").iter().map(rank).collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Property: batch size is at least 1, at most the recipient count and
    /// within the configured range when enough recipients exist
    #[test]
    fn prop_batch_size_in_range(recipients in 0usize..5000, conditions in conditions()) {
        let optimizer = MessageDeliveryOptimizer::default();
        let config = optimizer.config().clone();

        let size = optimizer.calculate_optimal_batch_size(recipients, &conditions);

        prop_assert!(size >= 1);
        prop_assert!(size <= recipients.max(1));
        prop_assert!(size <= config.max_batch_size);
        if recipients >= config.min_batch_size {
            prop_assert!(size >= config.min_batch_size);
        }
    }

    /// Property: more bandwidth never shrinks a batch
    #[test]
    fn prop_batch_size_monotone_in_bandwidth(
        conditions in conditions(),
        extra in 0.0f64..50_000.0,
    ) {
        let optimizer = MessageDeliveryOptimizer::default();
        let faster = NetworkConditions { bandwidth_kbps: conditions.bandwidth_kbps + extra, ..conditions };

        let slow = optimizer.calculate_optimal_batch_size(10_000, &conditions);
        let fast = optimizer.calculate_optimal_batch_size(10_000, &faster);
        prop_assert!(fast >= slow);
    }

    /// Property: more packet loss never grows a batch
    #[test]
    fn prop_batch_size_shrinks_with_loss(conditions in conditions(), extra in 0.0f64..=1.0) {
        let optimizer = MessageDeliveryOptimizer::default();
        let lossier = NetworkConditions {
            packet_loss: (conditions.packet_loss + extra).min(1.0),
            ..conditions
        };

        let clean = optimizer.calculate_optimal_batch_size(10_000, &conditions);
        let lossy = optimizer.calculate_optimal_batch_size(10_000, &lossier);
        prop_assert!(lossy <= clean);
    }

    /// Property: rate limits always allow progress and tighten under load
    #[test]
    fn prop_rate_limit_never_stalls(
        throughput in 0.0f64..100_000.0,
        extra in 0.0f64..100_000.0,
        utilization in 0.01f64..=1.0,
    ) {
        let optimizer = MessageDeliveryOptimizer::default();

        let light = optimizer.apply_rate_limiting(throughput, utilization);
        let heavy = optimizer.apply_rate_limiting(throughput + extra, utilization);

        prop_assert!(light.max_concurrent_deliveries > 0);
        prop_assert!(light.max_messages_per_second > 0);
        prop_assert!(heavy.max_concurrent_deliveries <= light.max_concurrent_deliveries);
        prop_assert!(heavy.batch_delay >= light.batch_delay);
    }
}

#[test]
fn rate_limit_ignores_non_finite_input() {
    let optimizer = MessageDeliveryOptimizer::default();
    let limit = optimizer.apply_rate_limiting(f64::NAN, f64::INFINITY);

    assert!(limit.max_concurrent_deliveries > 0);
    assert!(limit.max_messages_per_second > 0);
}
