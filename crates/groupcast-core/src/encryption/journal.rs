//! Undo log for the key writes of one lifecycle call.
//!
//! Initialize, add and remove touch many identities. If any write fails the
//! manager rolls every earlier write of the same call back, so the store
//! keeps describing the metadata the group still reports.

use groupcast_crypto::SenderKeyRecord;

use crate::{error::StoreError, store::SenderKeyStore, types::SenderKeyIdentity};

pub(crate) struct KeyJournal<'a> {
    store: &'a dyn SenderKeyStore,
    /// Identity and its record before this call, oldest first
    previous: Vec<(SenderKeyIdentity, Option<SenderKeyRecord>)>,
}

impl<'a> KeyJournal<'a> {
    pub(crate) fn new(store: &'a dyn SenderKeyStore) -> Self {
        Self { store, previous: Vec::new() }
    }

    pub(crate) async fn store(
        &mut self,
        identity: &SenderKeyIdentity,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        self.remember(identity).await?;
        self.store.store_sender_key(identity, record).await
    }

    pub(crate) async fn remove(&mut self, identity: &SenderKeyIdentity) -> Result<(), StoreError> {
        self.remember(identity).await?;
        self.store.remove_sender_key(identity).await
    }

    // Recorded before the write: a failed write may still have landed.
    async fn remember(&mut self, identity: &SenderKeyIdentity) -> Result<(), StoreError> {
        if self.previous.iter().any(|(seen, _)| seen == identity) {
            return Ok(());
        }
        let record = self.store.load_sender_key(identity).await?;
        self.previous.push((identity.clone(), record));
        Ok(())
    }

    /// Restore every touched identity, newest first. Returns how many could
    /// not be restored.
    pub(crate) async fn roll_back(self) -> usize {
        let mut unrestored = 0;
        for (identity, record) in self.previous.into_iter().rev() {
            let restored = match &record {
                Some(record) => self.store.store_sender_key(&identity, record).await,
                None => self.store.remove_sender_key(&identity).await,
            };
            if let Err(e) = restored {
                tracing::warn!(identity = %identity, error = %e, "Sender key rollback failed");
                unrestored += 1;
            }
        }
        unrestored
    }
}
