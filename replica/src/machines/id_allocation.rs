//! Replicated id range allocation
//!
//! A member asks for the range starting at the first id it believes unallocated. The
//! request wins only if nobody got there first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{ApplyOutcome, ResultCallback, StateMachine};
use crate::entry::{IdAllocationRequest, IdType};
use crate::error::Result;
use crate::storage::{BincodeMarshal, DurableStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocationState {
    pub first_unallocated: BTreeMap<IdType, u64>,
    pub applied_index: u64,
}

#[derive(Debug)]
pub struct IdAllocationStateMachine {
    state: IdAllocationState,
    durable: DurableStore<IdAllocationState, BincodeMarshal>,
}

impl IdAllocationStateMachine {
    pub fn open<P: AsRef<Path>>(dir: P, rotation_threshold: u64) -> Result<Self> {
        let durable = DurableStore::open(
            dir,
            "id-allocation",
            IdAllocationState::default(),
            rotation_threshold,
            BincodeMarshal,
        )?;
        Ok(IdAllocationStateMachine {
            state: durable.initial_state(),
            durable,
        })
    }

    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.state
            .first_unallocated
            .get(&id_type)
            .copied()
            .unwrap_or(0)
    }
}

impl StateMachine<IdAllocationRequest> for IdAllocationStateMachine {
    fn apply_command(
        &mut self,
        request: IdAllocationRequest,
        index: u64,
        callback: ResultCallback,
    ) -> Result<()> {
        if index <= self.state.applied_index {
            return Ok(());
        }
        let granted = request.range_start == self.first_unallocated(request.id_type);
        if granted {
            self.state.first_unallocated.insert(
                request.id_type,
                request.range_start + request.range_length,
            );
        } else {
            log::debug!(
                "id range {:?}@{} for {} lost, first unallocated is {}",
                request.id_type,
                request.range_start,
                request.owner,
                self.first_unallocated(request.id_type)
            );
        }
        self.state.applied_index = index;
        callback(Ok(ApplyOutcome::IdRangeGranted(granted)));
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
