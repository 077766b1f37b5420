//! Token registries (labels, relationship types, property keys)
//!
//! Token ids are allocated in log order inside the shared transactional store, so every
//! member hands out the same id for the same name.

use std::sync::{Arc, Mutex};

use super::transaction::{lock_store, TransactionStore};
use super::{ApplyOutcome, ResultCallback, StateMachine};
use crate::entry::{TokenKind, TokenRequest};
use crate::error::{CommandRejected, Result};

pub struct TokenStateMachine {
    kind: TokenKind,
    store: Arc<Mutex<TransactionStore>>,
}

impl TokenStateMachine {
    pub fn new(kind: TokenKind, store: Arc<Mutex<TransactionStore>>) -> Self {
        TokenStateMachine { kind, store }
    }
}

impl StateMachine<TokenRequest> for TokenStateMachine {
    fn apply_command(
        &mut self,
        command: TokenRequest,
        index: u64,
        callback: ResultCallback,
    ) -> Result<()> {
        let result = {
            let mut store = lock_store(&self.store);
            if index <= store.applied_index() {
                return Ok(());
            }
            let result = if command.name.is_empty() {
                Err(CommandRejected(format!("empty {:?} token name", self.kind)))
            } else {
                Ok(ApplyOutcome::TokenId(
                    store.get_or_create_token(self.kind, &command.name),
                ))
            };
            store.advance(index);
            result
        };
        callback(result);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        lock_store(&self.store).flush()
    }

    fn last_applied_index(&self) -> u64 {
        lock_store(&self.store).flushed_index()
    }
}
