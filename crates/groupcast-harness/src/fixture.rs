//! Whole-system fixture.

use std::sync::Arc;

use groupcast_core::{
    DistributorConfig, EncryptionConfig, EncryptionError, GroupEncryptionManager,
    GroupEncryptionService, GroupHistoryManager, GroupId, GroupMessageDistributor, HistoryConfig,
    MemorySenderKeyStore, MessageDeliveryOptimizer, OptimizerConfig, SenderKeyCipher,
    SenderKeyStore, Transport, UserId,
};

use crate::{
    repository::{MemoryChatRepository, MemoryMessageRepository, RecordingHistorySink, chat},
    sim_env::SimEnv,
    sim_transport::PeerTransport,
};

/// Every component wired over in-memory collaborators.
pub struct Fixture<T: Transport = PeerTransport> {
    /// Seeded environment
    pub env: SimEnv,
    /// Sender key store shared by the manager and the cipher
    pub store: Arc<MemorySenderKeyStore>,
    /// Encryption manager
    pub encryption: Arc<GroupEncryptionManager<SimEnv>>,
    /// Chat repository
    pub chats: Arc<MemoryChatRepository>,
    /// Message backlog
    pub messages: Arc<MemoryMessageRepository>,
    /// History sink
    pub sink: Arc<RecordingHistorySink>,
    /// Transport under test
    pub transport: Arc<T>,
    /// Optimizer shared with the distributor
    pub optimizer: Arc<MessageDeliveryOptimizer>,
    /// Distributor
    pub distributor: Arc<GroupMessageDistributor<SimEnv>>,
    /// History manager
    pub history: Arc<GroupHistoryManager>,
}

impl Fixture<PeerTransport> {
    /// Default fixture over a fault-free [`PeerTransport`].
    pub fn new(seed: u64) -> Self {
        Self::build(seed, PeerTransport::new(), None, DistributorConfig::default())
    }
}

impl<T: Transport> Fixture<T> {
    /// Fixture over `transport`.
    ///
    /// `service` replaces the default [`SenderKeyCipher`] when given.
    pub fn build(
        seed: u64,
        transport: T,
        service: Option<Arc<dyn GroupEncryptionService>>,
        config: DistributorConfig,
    ) -> Self {
        let env = SimEnv::with_seed(seed);
        let store = Arc::new(MemorySenderKeyStore::new());
        let key_store = Arc::clone(&store) as Arc<dyn SenderKeyStore>;
        let encryption_config = EncryptionConfig::default();

        let service: Arc<dyn GroupEncryptionService> = match service {
            Some(service) => service,
            None => Arc::new(SenderKeyCipher::new(
                env.clone(),
                Arc::clone(&key_store),
                encryption_config.key_lock_stripes,
            )),
        };
        let encryption = Arc::new(GroupEncryptionManager::new(
            env.clone(),
            key_store,
            service,
            encryption_config,
        ));

        let chats = Arc::new(MemoryChatRepository::new());
        let messages = Arc::new(MemoryMessageRepository::new());
        let sink = Arc::new(RecordingHistorySink::new());
        let transport = Arc::new(transport);
        let optimizer = Arc::new(MessageDeliveryOptimizer::new(OptimizerConfig::default()));

        let distributor = Arc::new(GroupMessageDistributor::new(
            env.clone(),
            Arc::clone(&chats) as _,
            Arc::clone(&encryption),
            Arc::clone(&transport) as _,
            Arc::clone(&optimizer),
            config,
        ));
        let history = Arc::new(GroupHistoryManager::new(
            Arc::clone(&chats) as _,
            Arc::clone(&messages) as _,
            Arc::clone(&sink) as _,
            HistoryConfig::default(),
        ));

        Self { env, store, encryption, chats, messages, sink, transport, optimizer, distributor, history }
    }

    /// Register a chat and initialize its encryption with the first
    /// participant as creator.
    pub async fn create_group(
        &self,
        id: &str,
        participants: Vec<UserId>,
    ) -> Result<GroupId, EncryptionError> {
        let group_id = GroupId::from(id);
        let creator = participants.first().cloned().unwrap_or_else(|| UserId::from("creator"));

        self.encryption.initialize_group_encryption(&group_id, &participants, &creator).await?;
        self.chats.insert(chat(id, participants));
        Ok(group_id)
    }
}

impl<T: Transport> std::fmt::Debug for Fixture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture").field("env", &self.env).finish_non_exhaustive()
    }
}
