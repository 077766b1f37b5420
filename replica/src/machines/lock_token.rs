//! Replicated cluster lock token
//!
//! Exactly one member holds the token at a time. A member takes it over by proposing the
//! next candidate id; concurrent proposals for the same candidate race through the log and
//! only the first one applied wins.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{ApplyOutcome, ResultCallback, StateMachine};
use crate::entry::{LockTokenRequest, MemberId};
use crate::error::Result;
use crate::storage::{BincodeMarshal, DurableStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner: Option<MemberId>,
    pub id: Option<u64>,
}

impl LockToken {
    pub fn next_candidate_id(&self) -> u64 {
        self.id.map_or(0, |id| id + 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTokenState {
    pub token: LockToken,
    pub applied_index: u64,
}

#[derive(Debug)]
pub struct LockTokenStateMachine {
    state: LockTokenState,
    durable: DurableStore<LockTokenState, BincodeMarshal>,
}

impl LockTokenStateMachine {
    pub fn open<P: AsRef<Path>>(dir: P, rotation_threshold: u64) -> Result<Self> {
        let durable = DurableStore::open(
            dir,
            "lock-token",
            LockTokenState::default(),
            rotation_threshold,
            BincodeMarshal,
        )?;
        Ok(LockTokenStateMachine {
            state: durable.initial_state(),
            durable,
        })
    }

    pub fn current_token(&self) -> LockToken {
        self.state.token
    }
}

impl StateMachine<LockTokenRequest> for LockTokenStateMachine {
    fn apply_command(
        &mut self,
        request: LockTokenRequest,
        index: u64,
        callback: ResultCallback,
    ) -> Result<()> {
        if index <= self.state.applied_index {
            return Ok(());
        }
        let granted = request.candidate_id == self.state.token.next_candidate_id();
        if granted {
            self.state.token = LockToken {
                owner: Some(request.owner),
                id: Some(request.candidate_id),
            };
            log::info!(
                "lock token {} granted to {} at index {}",
                request.candidate_id,
                request.owner,
                index
            );
        }
        self.state.applied_index = index;
        callback(Ok(ApplyOutcome::LockTokenGranted(granted)));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.durable.state() == &self.state {
            return Ok(());
        }
        self.durable.persist(self.state.clone())
    }

    fn last_applied_index(&self) -> u64 {
        self.durable.state().applied_index
    }
}
