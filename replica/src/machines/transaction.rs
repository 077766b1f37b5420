//! Transactional store and the transaction state machine
//!
//! The store holds key/value data and the token registries. It is the storage domain
//! shared by the transaction machine and the token machines, so all of them report the
//! watermark of the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ApplyOutcome, ResultCallback, StateMachine};
use crate::entry::{TokenKind, TransactionCommand};
use crate::error::Result;
use crate::storage::{BincodeMarshal, DurableStore};

pub const DEFAULT_MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreImage {
    pub applied_index: u64,
    pub data: BTreeMap<Vec<u8>, Vec<u8>>,
    pub tokens: BTreeMap<TokenKind, BTreeMap<String, u32>>,
}

#[derive(Debug)]
pub struct TransactionStore {
    image: StoreImage,
    durable: DurableStore<StoreImage, BincodeMarshal>,
}

impl TransactionStore {
    pub fn open<P: AsRef<Path>>(dir: P, rotation_threshold: u64) -> Result<Self> {
        let durable = DurableStore::open(
            dir,
            "transaction-store",
            StoreImage::default(),
            rotation_threshold,
            BincodeMarshal,
        )?;
        let image = durable.initial_state();
        log::info!(
            "transaction store recovered at index {}",
            image.applied_index
        );
        Ok(TransactionStore { image, durable })
    }

    /// Highest index applied in memory
    pub fn applied_index(&self) -> u64 {
        self.image.applied_index
    }

    /// Highest index made durable by `flush`
    pub fn flushed_index(&self) -> u64 {
        self.durable.state().applied_index
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.image.data.get(key).map(|v| v.as_slice())
    }

    pub fn token_id(&self, kind: TokenKind, name: &str) -> Option<u32> {
        self.image.tokens.get(&kind)?.get(name).copied()
    }

    fn commit(&mut self, index: u64, command: TransactionCommand) {
        for write in command.writes {
            match write.value {
                Some(value) => {
                    self.image.data.insert(write.key, value);
                }
                None => {
                    self.image.data.remove(&write.key);
                }
            }
        }
        self.image.applied_index = index;
    }

    /// Returns the id of `name`, creating it when missing
    pub(crate) fn get_or_create_token(&mut self, kind: TokenKind, name: &str) -> u32 {
        let registry = self.image.tokens.entry(kind).or_default();
        let next_id = registry.len() as u32;
        *registry.entry(name.to_string()).or_insert(next_id)
    }

    pub(crate) fn advance(&mut self, index: u64) {
        self.image.applied_index = self.image.applied_index.max(index);
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.durable.state() == &self.image {
            return Ok(());
        }
        self.durable.persist(self.image.clone())
    }
}

pub(crate) fn lock_store(store: &Mutex<TransactionStore>) -> MutexGuard<'_, TransactionStore> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

/// Buffers consecutive transactions and commits them to the store as one batch
pub struct TransactionStateMachine {
    store: Arc<Mutex<TransactionStore>>,
    batch: Vec<(u64, TransactionCommand, ResultCallback)>,
    max_batch: usize,
}

impl TransactionStateMachine {
    pub fn new(store: Arc<Mutex<TransactionStore>>, max_batch: usize) -> Self {
        TransactionStateMachine {
            store,
            batch: Vec::new(),
            max_batch: max_batch.max(1),
        }
    }
}

impl StateMachine<TransactionCommand> for TransactionStateMachine {
    fn apply_command(
        &mut self,
        command: TransactionCommand,
        index: u64,
        callback: ResultCallback,
    ) -> Result<()> {
        let applied = lock_store(&self.store).applied_index();
        if index <= applied {
            log::debug!("ignoring transaction at {}, store already at {}", index, applied);
            return Ok(());
        }
        self.batch.push((index, command, callback));
        if self.batch.len() >= self.max_batch {
            self.ensure_applied()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_applied()?;
        lock_store(&self.store).flush()
    }

    fn ensure_applied(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let mut callbacks = Vec::with_capacity(batch.len());
        {
            let mut store = lock_store(&self.store);
            for (index, command, callback) in batch {
                store.commit(index, command);
                callbacks.push((index, callback));
            }
        }
        for (index, callback) in callbacks {
            callback(Ok(ApplyOutcome::Committed { index }));
        }
        Ok(())
    }

    fn batches(&self) -> bool {
        true
    }

    fn last_applied_index(&self) -> u64 {
        lock_store(&self.store).flushed_index()
    }
}
