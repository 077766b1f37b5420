//! Replicated operation de-duplication
//!
//! A member may resubmit an operation it is unsure about. Each owner has one current
//! global session and, inside it, local sessions whose operations carry consecutive
//! sequence numbers. An operation is applied only when it is the next one expected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entry::{GlobalSession, LocalOperationId, MemberId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OwnerSessions {
    global_session: GlobalSession,
    /// Last applied sequence number per local session
    last_sequence: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTracker {
    owners: BTreeMap<MemberId, OwnerSessions>,
    /// Index of the last operation recorded
    last_index: u64,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Whether `operation_id` is the next operation expected from `global_session`
    pub fn validate_operation(
        &self,
        global_session: &GlobalSession,
        operation_id: &LocalOperationId,
    ) -> bool {
        match self.owners.get(&global_session.owner) {
            Some(owner) if owner.global_session == *global_session => {
                match owner.last_sequence.get(&operation_id.local_session_id) {
                    Some(last) => operation_id.sequence_number == last + 1,
                    None => operation_id.sequence_number == 0,
                }
            }
            // unknown owner or a new global session replacing the old one
            _ => operation_id.sequence_number == 0,
        }
    }

    pub fn update(
        &mut self,
        global_session: GlobalSession,
        operation_id: LocalOperationId,
        index: u64,
    ) {
        let owner = self
            .owners
            .entry(global_session.owner)
            .or_insert_with(|| OwnerSessions {
                global_session,
                last_sequence: BTreeMap::new(),
            });
        if owner.global_session != global_session {
            log::info!(
                "{} started a new global session {}",
                global_session.owner,
                global_session.session_id
            );
            owner.global_session = global_session;
            owner.last_sequence.clear();
        }
        owner
            .last_sequence
            .insert(operation_id.local_session_id, operation_id.sequence_number);
        self.last_index = self.last_index.max(index);
    }
}
