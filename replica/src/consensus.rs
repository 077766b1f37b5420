//! Durable term and vote
//!
//! The election algorithm lives elsewhere; this module only enforces the rules the
//! persisted values must obey and keeps them across crashes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::entry::MemberId;
use crate::error::{Error, Result};
use crate::health::Health;
use crate::storage::{BincodeMarshal, DurableStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermState {
    term: u64,
}

impl TermState {
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Moves to `term`. Returns whether it changed; terms never go backwards.
    pub fn update(&mut self, term: u64) -> Result<bool> {
        if term < self.term {
            return Err(Error::ConsensusViolation(format!(
                "term cannot decrease from {} to {}",
                self.term, term
            )));
        }
        let changed = term != self.term;
        self.term = term;
        Ok(changed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteState {
    term: u64,
    voted_for: Option<MemberId>,
}

impl VoteState {
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.voted_for
    }

    /// Records a vote, `None` only moves the term. A newer term clears the previous vote.
    /// Returns whether anything changed.
    pub fn update(&mut self, voted_for: Option<MemberId>, term: u64) -> Result<bool> {
        if term < self.term {
            return Err(Error::ConsensusViolation(format!(
                "vote for term {} after term {}",
                term, self.term
            )));
        }
        if term > self.term {
            self.term = term;
            self.voted_for = voted_for;
            return Ok(true);
        }
        match (self.voted_for, voted_for) {
            (_, None) => Ok(false),
            (None, Some(candidate)) => {
                self.voted_for = Some(candidate);
                Ok(true)
            }
            (Some(current), Some(candidate)) if current == candidate => Ok(false),
            (Some(current), Some(candidate)) => Err(Error::ConsensusViolation(format!(
                "already voted for {} in term {}, not {}",
                current, term, candidate
            ))),
        }
    }
}

/// Term and vote as seen by the election algorithm, each in its own durable slot
pub struct ConsensusStore {
    term: DurableStore<TermState, BincodeMarshal>,
    vote: DurableStore<VoteState, BincodeMarshal>,
    health: Health,
}

impl ConsensusStore {
    pub fn open<P: AsRef<Path>>(dir: P, rotation_threshold: u64, health: Health) -> Result<Self> {
        let dir = dir.as_ref();
        let term = DurableStore::open(
            dir,
            "term",
            TermState::default(),
            rotation_threshold,
            BincodeMarshal,
        )?;
        let vote = DurableStore::open(
            dir,
            "vote",
            VoteState::default(),
            rotation_threshold,
            BincodeMarshal,
        )?;
        log::info!(
            "recovered term {} and vote {:?}",
            term.state().term(),
            vote.state().voted_for()
        );
        Ok(ConsensusStore { term, vote, health })
    }

    pub fn term(&self) -> TermState {
        *self.term.state()
    }

    pub fn vote(&self) -> VoteState {
        *self.vote.state()
    }

    pub fn update_term(&mut self, term: u64) -> Result<bool> {
        let mut next = self.term();
        if !next.update(term)? {
            return Ok(false);
        }
        let result = self.term.persist(next);
        self.fail_unhealthy("term", result)?;
        Ok(true)
    }

    pub fn update_vote(&mut self, voted_for: Option<MemberId>, term: u64) -> Result<bool> {
        let mut next = self.vote();
        if !next.update(voted_for, term)? {
            return Ok(false);
        }
        let result = self.vote.persist(next);
        self.fail_unhealthy("vote", result)?;
        Ok(true)
    }

    fn fail_unhealthy(&self, what: &str, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            self.health
                .mark_unhealthy(format!("failed to persist {}: {}", what, e));
        }
        result
    }

    pub fn shutdown(self) -> Result<()> {
        self.term.shutdown()?;
        self.vote.shutdown()
    }
}
