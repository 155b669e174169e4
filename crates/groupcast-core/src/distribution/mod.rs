//! Group Message Distributor
//!
//! Fans one message out to every participant of a group. The message is
//! encrypted once per pass, on the first send, and every recipient gets its
//! own envelope and transport send; outcomes are isolated and aggregated into
//! a [`DistributionResult`]. The only error that aborts a distribution is an
//! unknown group.
//!
//! # Strategies
//!
//! ```text
//!  recipients   strategy       shape
//!  < 100        DIRECT         all at once under the rate limit
//!  < 1000       BATCHED        optimizer-sized batches, one after another
//!  < 10000      TREE_ROUTING   k-ary relay tree, level by level
//!  otherwise    HYBRID_MESH    clusters in parallel, each a relay tree
//! ```
//!
//! The origin issues every send itself in all four strategies. In the relay
//! topologies `relay_via` is a hint for the transport; only the hop depth is
//! logarithmic in the group size.
//!
//! Every send runs as a task on a [`JoinSet`] and holds a permit of a
//! semaphore sized by the optimizer's rate limit. Cancelling stops new sends;
//! sends already in flight finish and are counted.
//!
//! Finished distributions expire `result_retention` after their last pass.
//! Expired ones are swept whenever a new distribution starts, or on
//! [`GroupMessageDistributor::expire_finished_distributions`].

mod strategy;
mod topology;
mod tracker;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
pub use strategy::{
    BATCHED_THRESHOLD, DIRECT_THRESHOLD, DistributionStrategy, TREE_ROUTING_THRESHOLD,
};
use tokio::{
    sync::{OnceCell, RwLock, Semaphore, watch},
    task::{JoinHandle, JoinSet},
};
pub use topology::{PlannedSend, fixed_relays, round_robin_relays, tree_levels};
pub use tracker::{DistributionProgress, DistributionResult, DistributionStatus};
use tracker::DistributionTracker;

use crate::{
    config::DistributorConfig,
    encryption::GroupEncryptionManager,
    env::Environment,
    error::{DeliveryError, DistributionError},
    optimizer::MessageDeliveryOptimizer,
    repository::ChatRepository,
    transport::{DeliveryEnvelope, Transport},
    types::{DeviceId, DistributionId, GroupId, UserId},
};

/// Picks a strategy by recipient count and fans messages out.
pub struct GroupMessageDistributor<E: Environment> {
    env: E,
    config: DistributorConfig,
    chats: Arc<dyn ChatRepository>,
    encryption: Arc<GroupEncryptionManager<E>>,
    transport: Arc<dyn Transport>,
    optimizer: Arc<MessageDeliveryOptimizer>,
    distributions: RwLock<HashMap<DistributionId, Arc<DistributionTracker>>>,
}

impl<E: Environment> GroupMessageDistributor<E> {
    /// Create a distributor.
    pub fn new(
        env: E,
        chats: Arc<dyn ChatRepository>,
        encryption: Arc<GroupEncryptionManager<E>>,
        transport: Arc<dyn Transport>,
        optimizer: Arc<MessageDeliveryOptimizer>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            env,
            config,
            chats,
            encryption,
            transport,
            optimizer,
            distributions: RwLock::new(HashMap::new()),
        }
    }

    /// Strategy tier for `recipient_count`.
    pub fn optimal_distribution_strategy(&self, recipient_count: usize) -> DistributionStrategy {
        DistributionStrategy::for_recipient_count(recipient_count)
    }

    /// Send `message` from `sender_id` to every participant of the group.
    ///
    /// Succeeds even if every delivery fails; see the counters of the
    /// returned result.
    #[tracing::instrument(skip_all, fields(group_id = %group_id, sender_id = %sender_id))]
    pub async fn distribute_message(
        &self,
        group_id: &GroupId,
        message: Bytes,
        sender_id: &UserId,
    ) -> Result<DistributionResult, DistributionError> {
        let (tracker, recipients) = self.prepare(group_id, message, sender_id, None).await?;
        Ok(self.execute(&tracker, recipients, tracker.strategy()).await)
    }

    /// Like [`Self::distribute_message`], but always routes through a relay
    /// tree.
    #[tracing::instrument(skip_all, fields(group_id = %group_id, sender_id = %sender_id))]
    pub async fn distribute_message_with_tree_routing(
        &self,
        group_id: &GroupId,
        message: Bytes,
        sender_id: &UserId,
    ) -> Result<DistributionResult, DistributionError> {
        let (tracker, recipients) = self
            .prepare(group_id, message, sender_id, Some(DistributionStrategy::TreeRouting))
            .await?;
        Ok(self.execute(&tracker, recipients, DistributionStrategy::TreeRouting).await)
    }

    /// Start a distribution in the background.
    ///
    /// The group is resolved before returning, so an unknown group fails
    /// here. The id can be used to observe or cancel the run while it is in
    /// flight.
    pub async fn spawn_distribution(
        self: &Arc<Self>,
        group_id: &GroupId,
        message: Bytes,
        sender_id: &UserId,
    ) -> Result<(DistributionId, JoinHandle<DistributionResult>), DistributionError> {
        let (tracker, recipients) = self.prepare(group_id, message, sender_id, None).await?;
        let id = tracker.id();

        let this = Arc::clone(self);
        let handle =
            tokio::spawn(async move { this.execute(&tracker, recipients, tracker.strategy()).await });
        Ok((id, handle))
    }

    /// Progress stream of a distribution.
    pub async fn observe_distribution_progress(
        &self,
        distribution_id: DistributionId,
    ) -> Result<watch::Receiver<DistributionProgress>, DistributionError> {
        Ok(self.tracker(distribution_id).await?.subscribe())
    }

    /// Current result of a distribution.
    pub async fn distribution_result(
        &self,
        distribution_id: DistributionId,
    ) -> Result<DistributionResult, DistributionError> {
        Ok(self.tracker(distribution_id).await?.result())
    }

    /// Stop issuing sends for an in-flight distribution.
    ///
    /// In-flight sends finish; recipients never attempted are counted as
    /// failed and can be retried.
    pub async fn cancel_distribution(
        &self,
        distribution_id: DistributionId,
    ) -> Result<(), DistributionError> {
        self.tracker(distribution_id).await?.cancel()?;
        tracing::info!(distribution_id = %distribution_id, "Distribution cancellation requested");
        Ok(())
    }

    /// Re-send to the recipients that failed, in batches.
    ///
    /// Recipients delivered now move from failed to successful.
    pub async fn retry_failed_deliveries(
        &self,
        distribution_id: DistributionId,
    ) -> Result<DistributionResult, DistributionError> {
        let tracker = self.tracker(distribution_id).await?;
        let failed = tracker.begin_retry()?;

        tracing::info!(
            distribution_id = %distribution_id,
            recipients = failed.len(),
            "Retrying failed deliveries"
        );
        Ok(self.execute(&tracker, failed, DistributionStrategy::Batched).await)
    }

    /// Forget every distribution that finished more than `result_retention`
    /// ago. Returns how many were dropped.
    pub async fn expire_finished_distributions(&self) -> usize {
        let mut distributions = self.distributions.write().await;
        self.expire(&mut distributions)
    }

    /// Forget a finished distribution. Its id becomes unknown.
    pub async fn remove_distribution(
        &self,
        distribution_id: DistributionId,
    ) -> Result<DistributionResult, DistributionError> {
        let mut distributions = self.distributions.write().await;
        let tracker = distributions
            .get(&distribution_id)
            .ok_or(DistributionError::DistributionNotFound(distribution_id))?;
        if !tracker.is_terminal() {
            return Err(DistributionError::StillInProgress(distribution_id));
        }

        let result = tracker.result();
        distributions.remove(&distribution_id);
        Ok(result)
    }

    async fn tracker(
        &self,
        distribution_id: DistributionId,
    ) -> Result<Arc<DistributionTracker>, DistributionError> {
        self.distributions
            .read()
            .await
            .get(&distribution_id)
            .cloned()
            .ok_or(DistributionError::DistributionNotFound(distribution_id))
    }

    async fn prepare(
        &self,
        group_id: &GroupId,
        message: Bytes,
        sender_id: &UserId,
        forced: Option<DistributionStrategy>,
    ) -> Result<(Arc<DistributionTracker>, Vec<UserId>), DistributionError> {
        let chat = self
            .chats
            .get_chat_by_id(group_id)
            .await?
            .ok_or_else(|| DistributionError::GroupNotFound(group_id.clone()))?;

        let mut seen = HashSet::with_capacity(chat.participants.len());
        let recipients: Vec<UserId> =
            chat.participants.into_iter().filter(|p| seen.insert(p.clone())).collect();

        let strategy = forced.unwrap_or_else(|| self.optimal_distribution_strategy(recipients.len()));
        let id = DistributionId(self.env.random_u128());
        let tracker = Arc::new(DistributionTracker::new(
            id,
            group_id.clone(),
            sender_id.clone(),
            message,
            strategy,
            &recipients,
            self.env.wall_clock_millis(),
        ));
        {
            let mut distributions = self.distributions.write().await;
            self.expire(&mut distributions);
            distributions.insert(id, Arc::clone(&tracker));
        }

        tracing::info!(
            distribution_id = %id,
            group_id = %group_id,
            recipients = recipients.len(),
            strategy = %strategy,
            "Distribution started"
        );
        Ok((tracker, recipients))
    }

    // Caller holds the registry write lock. A tracker someone still holds is
    // kept, so a retry that already looked it up is not orphaned.
    fn expire(&self, distributions: &mut HashMap<DistributionId, Arc<DistributionTracker>>) -> usize {
        let retention = u64::try_from(self.config.result_retention.as_millis()).unwrap_or(u64::MAX);
        let Some(cutoff) = self.env.wall_clock_millis().checked_sub(retention) else {
            return 0;
        };

        let before = distributions.len();
        distributions
            .retain(|_, tracker| Arc::strong_count(tracker) > 1 || !tracker.finished_by(cutoff));
        let expired = before - distributions.len();
        if expired > 0 {
            tracing::debug!(expired, "Finished distributions expired");
        }
        expired
    }

    /// Run one pass over `recipients` and finalize it.
    async fn execute(
        &self,
        tracker: &Arc<DistributionTracker>,
        recipients: Vec<UserId>,
        strategy: DistributionStrategy,
    ) -> DistributionResult {
        let rate = self
            .optimizer
            .apply_rate_limiting(self.config.current_throughput, self.config.target_utilization);
        let dispatcher = Dispatcher {
            ctx: Arc::new(SendContext {
                encryption: Arc::clone(&self.encryption),
                transport: Arc::clone(&self.transport),
                tracker: Arc::clone(tracker),
                sender_device: self.config.sender_device_id,
                send_timeout: self.config.send_timeout,
                ciphertext: OnceCell::new(),
            }),
            permits: Arc::new(Semaphore::new(rate.max_concurrent_deliveries)),
        };

        match strategy {
            DistributionStrategy::Direct => {
                dispatcher.wave(recipients.into_iter().map(PlannedSend::direct).collect()).await;
            },
            DistributionStrategy::Batched => {
                let order = self.optimizer.optimize_delivery_order(&recipients, tracker.message());
                let batch_size = self
                    .optimizer
                    .calculate_optimal_batch_size(order.len(), &self.config.network_conditions);
                dispatcher.batches(order, batch_size, rate.batch_delay).await;
            },
            DistributionStrategy::TreeRouting => {
                let order = self.optimizer.optimize_delivery_order(&recipients, tracker.message());
                dispatcher.tree(&order, self.config.tree_fanout, RelayPolicy::Fixed).await;
            },
            DistributionStrategy::HybridMesh => {
                let order = self.optimizer.optimize_delivery_order(&recipients, tracker.message());
                dispatcher.mesh(order, self.config.mesh_cluster_size, self.config.tree_fanout).await;
            },
        }

        let result = tracker.finish(self.env.wall_clock_millis());
        tracing::info!(
            distribution_id = %result.distribution_id,
            status = ?result.status,
            total = result.total_recipients,
            successful = result.successful_deliveries,
            failed = result.failed_deliveries,
            "Distribution pass finished"
        );
        result
    }
}

impl<E: Environment> std::fmt::Debug for GroupMessageDistributor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMessageDistributor")
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

/// How relays are picked for a tree level.
#[derive(Debug, Clone, Copy)]
enum RelayPolicy {
    /// Each child has one parent; a failed parent means a direct send
    Fixed,
    /// Children are dealt over the delivered members of the previous level
    RoundRobin,
}

/// Everything a delivery task needs, shared across tasks of one pass.
struct SendContext<E: Environment> {
    encryption: Arc<GroupEncryptionManager<E>>,
    transport: Arc<dyn Transport>,
    tracker: Arc<DistributionTracker>,
    sender_device: DeviceId,
    send_timeout: Duration,
    /// Message encrypted once for the whole pass. A failed attempt leaves it
    /// empty and the next send tries again.
    ciphertext: OnceCell<Bytes>,
}

impl<E: Environment> SendContext<E> {
    async fn ciphertext(&self) -> Result<Bytes, DeliveryError> {
        let tracker = &self.tracker;
        let ciphertext = self
            .ciphertext
            .get_or_try_init(|| async {
                let encrypted = self
                    .encryption
                    .encrypt_group_message(
                        tracker.group_id(),
                        tracker.sender_id(),
                        self.sender_device,
                        tracker.message(),
                    )
                    .await?;
                encrypted
                    .to_bytes()
                    .map(Bytes::from)
                    .map_err(|e| DeliveryError::Encoding(e.to_string()))
            })
            .await?;
        Ok(ciphertext.clone())
    }

    async fn deliver(&self, send: &PlannedSend) -> Result<(), DeliveryError> {
        let tracker = &self.tracker;
        let ciphertext = self.ciphertext().await?;

        let envelope = DeliveryEnvelope {
            distribution_id: tracker.id(),
            group_id: tracker.group_id().clone(),
            sender_id: tracker.sender_id().clone(),
            recipient_id: send.recipient.clone(),
            relay_via: send.relay_via.clone(),
            hop: send.hop,
            ciphertext,
        };

        match tokio::time::timeout(self.send_timeout, self.transport.send(envelope)).await {
            Ok(Ok(_handle)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        }
    }
}

/// Issues sends for one pass.
struct Dispatcher<E: Environment> {
    ctx: Arc<SendContext<E>>,
    permits: Arc<Semaphore>,
}

impl<E: Environment> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self { ctx: Arc::clone(&self.ctx), permits: Arc::clone(&self.permits) }
    }
}

impl<E: Environment> Dispatcher<E> {
    /// Send to every planned recipient concurrently and wait for all of
    /// them. Returns the recipients delivered.
    async fn wave(&self, sends: Vec<PlannedSend>) -> HashSet<UserId> {
        let cancel = self.ctx.tracker.cancel_token();
        let mut tasks = JoinSet::new();

        for send in sends {
            let ctx = Arc::clone(&self.ctx);
            let permits = Arc::clone(&self.permits);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return None;
                };
                // Unattempted recipients stay pending and are failed on finish
                if cancel.is_cancelled() {
                    return None;
                }

                let outcome = ctx.deliver(&send).await;
                let delivered = outcome.is_ok();
                if let Err(e) = &outcome {
                    tracing::warn!(
                        distribution_id = %ctx.tracker.id(),
                        recipient_id = %send.recipient,
                        error = %e,
                        "Delivery failed"
                    );
                }
                ctx.tracker.record(&send.recipient, outcome);
                delivered.then_some(send.recipient)
            });
        }

        let mut delivered = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(recipient)) => {
                    delivered.insert(recipient);
                },
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!(distribution_id = %self.ctx.tracker.id(), error = %e, "Delivery task failed");
                },
            }
        }
        delivered
    }

    async fn batches(&self, order: Vec<UserId>, batch_size: usize, delay: Duration) {
        let cancel = self.ctx.tracker.cancel_token();
        let batch_count = order.len().div_ceil(batch_size.max(1));

        for (index, batch) in order.chunks(batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                tracing::debug!(distribution_id = %self.ctx.tracker.id(), batch = index, "Batches stopped by cancel");
                break;
            }

            let delivered = self.wave(batch.iter().cloned().map(PlannedSend::direct).collect()).await;
            tracing::debug!(
                distribution_id = %self.ctx.tracker.id(),
                batch = index,
                size = batch.len(),
                delivered = delivered.len(),
                "Batch dispatched"
            );

            if index + 1 < batch_count && !delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => {},
                    () = tokio::time::sleep(delay) => {},
                }
            }
        }
    }

    async fn tree(&self, order: &[UserId], fanout: usize, policy: RelayPolicy) {
        let cancel = self.ctx.tracker.cancel_token();
        let mut previous: &[UserId] = &[];
        let mut delivered = HashSet::new();

        for (depth, level) in tree_levels(order, fanout).into_iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::debug!(distribution_id = %self.ctx.tracker.id(), depth, "Tree stopped by cancel");
                break;
            }

            let hop = depth as u32;
            let sends = match policy {
                RelayPolicy::Fixed => fixed_relays(level, previous, &delivered, fanout, hop),
                RelayPolicy::RoundRobin => {
                    let relays: Vec<UserId> =
                        previous.iter().filter(|p| delivered.contains(*p)).cloned().collect();
                    round_robin_relays(level, &relays, fanout, hop)
                },
            };

            delivered = self.wave(sends).await;
            tracing::debug!(
                distribution_id = %self.ctx.tracker.id(),
                depth,
                size = level.len(),
                delivered = delivered.len(),
                "Tree level dispatched"
            );
            previous = level;
        }
    }

    async fn mesh(&self, order: Vec<UserId>, cluster_size: usize, fanout: usize) {
        let mut clusters = JoinSet::new();

        for cluster in order.chunks(cluster_size.max(1)) {
            let dispatcher = self.clone();
            let cluster = cluster.to_vec();
            clusters.spawn(async move {
                dispatcher.tree(&cluster, fanout, RelayPolicy::RoundRobin).await;
            });
        }

        while let Some(joined) = clusters.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(distribution_id = %self.ctx.tracker.id(), error = %e, "Mesh cluster failed");
            }
        }
    }
}
