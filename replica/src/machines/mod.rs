//! Replicated state machines
//!
//! Every machine sees its commands in log order, from a single thread, never re-entrantly.
//! Machines that share one physical store are registered under the same
//! [`StorageDomain`] and report one watermark for it.

pub mod id_allocation;
pub mod lock_token;
pub mod token;
pub mod transaction;

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::entry::{
    CommandKind, IdAllocationRequest, LockTokenRequest, TokenKind, TokenRequest,
    TransactionCommand,
};
use crate::error::{CommandRejected, Error, Result};

pub use self::id_allocation::IdAllocationStateMachine;
pub use self::lock_token::LockTokenStateMachine;
pub use self::token::TokenStateMachine;
pub use self::transaction::{TransactionStateMachine, TransactionStore};

/// What applying one command produced, delivered to whoever awaits its index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed { index: u64 },
    TokenId(u32),
    IdRangeGranted(bool),
    LockTokenGranted(bool),
    Noop,
}

pub type ApplyResult = std::result::Result<ApplyOutcome, CommandRejected>;

/// Reports the outcome of one command. State machines call it exactly once per command
/// they apply; commands skipped on replay are not reported.
pub type ResultCallback = Box<dyn FnOnce(ApplyResult) + Send>;

pub trait StateMachine<C>: Send {
    /// Applies or buffers `command`. Commands at or below the machine's own applied
    /// index must be ignored so that replay after a crash is harmless.
    fn apply_command(&mut self, command: C, index: u64, callback: ResultCallback) -> Result<()>;

    /// Makes everything applied so far durable in the machine's own storage
    fn flush(&mut self) -> Result<()>;

    /// Completes any buffered batch before returning
    fn ensure_applied(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether commands are buffered until `ensure_applied`. Only batching machines are
    /// sealed when a run of their kind ends.
    fn batches(&self) -> bool {
        false
    }

    /// Highest index durably reflected in this machine's storage
    fn last_applied_index(&self) -> u64;
}

/// Label of a physical store. Machines with the same label share one watermark.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageDomain(String);

impl StorageDomain {
    pub fn new(name: impl Into<String>) -> Self {
        StorageDomain(name.into())
    }
}

struct Registered<C> {
    domain: StorageDomain,
    machine: Box<dyn StateMachine<C>>,
}

impl<C> Registered<C> {
    fn new(domain: StorageDomain, machine: impl StateMachine<C> + 'static) -> Self {
        Registered {
            domain,
            machine: Box::new(machine),
        }
    }
}

/// The fixed set of machines, one per command kind
pub struct StateMachines {
    transactions: Registered<TransactionCommand>,
    id_allocation: Registered<IdAllocationRequest>,
    labels: Registered<TokenRequest>,
    relationship_types: Registered<TokenRequest>,
    property_keys: Registered<TokenRequest>,
    lock_token: Registered<LockTokenRequest>,
}

impl StateMachines {
    pub fn builder() -> StateMachinesBuilder {
        StateMachinesBuilder::default()
    }

    /// Opens the standard machines under `state_dir`: transactions and the three token
    /// registries share one transactional store, id allocation and the lock token each
    /// own a durable slot.
    pub fn open_standard<P: AsRef<Path>>(state_dir: P, rotation_threshold: u64) -> Result<Self> {
        let dir = state_dir.as_ref();
        let store = Arc::new(Mutex::new(TransactionStore::open(dir, rotation_threshold)?));
        let shared = StorageDomain::new("transaction-store");
        StateMachines::builder()
            .transactions(
                shared.clone(),
                TransactionStateMachine::new(store.clone(), transaction::DEFAULT_MAX_BATCH),
            )
            .tokens(
                TokenKind::Label,
                shared.clone(),
                TokenStateMachine::new(TokenKind::Label, store.clone()),
            )
            .tokens(
                TokenKind::RelationshipType,
                shared.clone(),
                TokenStateMachine::new(TokenKind::RelationshipType, store.clone()),
            )
            .tokens(
                TokenKind::PropertyKey,
                shared,
                TokenStateMachine::new(TokenKind::PropertyKey, store),
            )
            .id_allocation(
                StorageDomain::new("id-allocation"),
                IdAllocationStateMachine::open(dir, rotation_threshold)?,
            )
            .lock_token(
                StorageDomain::new("lock-token"),
                LockTokenStateMachine::open(dir, rotation_threshold)?,
            )
            .build()
    }

    pub fn transactions(&mut self) -> &mut dyn StateMachine<TransactionCommand> {
        self.transactions.machine.as_mut()
    }

    pub fn id_allocation(&mut self) -> &mut dyn StateMachine<IdAllocationRequest> {
        self.id_allocation.machine.as_mut()
    }

    pub fn tokens(&mut self, kind: TokenKind) -> &mut dyn StateMachine<TokenRequest> {
        match kind {
            TokenKind::Label => self.labels.machine.as_mut(),
            TokenKind::RelationshipType => self.relationship_types.machine.as_mut(),
            TokenKind::PropertyKey => self.property_keys.machine.as_mut(),
        }
    }

    pub fn lock_token(&mut self) -> &mut dyn StateMachine<LockTokenRequest> {
        self.lock_token.machine.as_mut()
    }

    pub fn batches(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Transaction => self.transactions.machine.batches(),
            CommandKind::IdAllocation => self.id_allocation.machine.batches(),
            CommandKind::Token(TokenKind::Label) => self.labels.machine.batches(),
            CommandKind::Token(TokenKind::RelationshipType) => {
                self.relationship_types.machine.batches()
            }
            CommandKind::Token(TokenKind::PropertyKey) => self.property_keys.machine.batches(),
            CommandKind::LockToken => self.lock_token.machine.batches(),
            CommandKind::Noop => false,
        }
    }

    /// Completes the open batch of the machine owning `kind`
    pub fn ensure_applied(&mut self, kind: CommandKind) -> Result<()> {
        match kind {
            CommandKind::Transaction => self.transactions().ensure_applied(),
            CommandKind::IdAllocation => self.id_allocation().ensure_applied(),
            CommandKind::Token(token_kind) => self.tokens(token_kind).ensure_applied(),
            CommandKind::LockToken => self.lock_token().ensure_applied(),
            CommandKind::Noop => Ok(()),
        }
    }

    pub fn flush_all(&mut self) -> Result<()> {
        self.transactions().flush()?;
        self.labels.machine.flush()?;
        self.relationship_types.machine.flush()?;
        self.property_keys.machine.flush()?;
        self.id_allocation().flush()?;
        self.lock_token().flush()
    }

    fn watermarks(&self) -> [(&StorageDomain, u64); 6] {
        [
            (
                &self.transactions.domain,
                self.transactions.machine.last_applied_index(),
            ),
            (&self.labels.domain, self.labels.machine.last_applied_index()),
            (
                &self.relationship_types.domain,
                self.relationship_types.machine.last_applied_index(),
            ),
            (
                &self.property_keys.domain,
                self.property_keys.machine.last_applied_index(),
            ),
            (
                &self.id_allocation.domain,
                self.id_allocation.machine.last_applied_index(),
            ),
            (
                &self.lock_token.domain,
                self.lock_token.machine.last_applied_index(),
            ),
        ]
    }

    /// Minimum applied index across distinct storage domains: the log may be truncated
    /// up to here. Each domain contributes once, through its first registered machine.
    pub fn last_applied_index(&self) -> u64 {
        let mut seen: Vec<&StorageDomain> = Vec::with_capacity(6);
        let mut min = u64::MAX;
        for (domain, index) in self.watermarks() {
            if seen.contains(&domain) {
                continue;
            }
            seen.push(domain);
            min = min.min(index);
        }
        min
    }
}

#[derive(Default)]
pub struct StateMachinesBuilder {
    transactions: Option<Registered<TransactionCommand>>,
    id_allocation: Option<Registered<IdAllocationRequest>>,
    labels: Option<Registered<TokenRequest>>,
    relationship_types: Option<Registered<TokenRequest>>,
    property_keys: Option<Registered<TokenRequest>>,
    lock_token: Option<Registered<LockTokenRequest>>,
}

fn required<C>(slot: Option<Registered<C>>, what: &str) -> Result<Registered<C>> {
    slot.ok_or_else(|| Error::Config(format!("no state machine registered for {}", what)))
}

impl StateMachinesBuilder {
    pub fn transactions(
        mut self,
        domain: StorageDomain,
        machine: impl StateMachine<TransactionCommand> + 'static,
    ) -> Self {
        self.transactions = Some(Registered::new(domain, machine));
        self
    }

    pub fn id_allocation(
        mut self,
        domain: StorageDomain,
        machine: impl StateMachine<IdAllocationRequest> + 'static,
    ) -> Self {
        self.id_allocation = Some(Registered::new(domain, machine));
        self
    }

    pub fn tokens(
        mut self,
        kind: TokenKind,
        domain: StorageDomain,
        machine: impl StateMachine<TokenRequest> + 'static,
    ) -> Self {
        let registered = Some(Registered::new(domain, machine));
        match kind {
            TokenKind::Label => self.labels = registered,
            TokenKind::RelationshipType => self.relationship_types = registered,
            TokenKind::PropertyKey => self.property_keys = registered,
        }
        self
    }

    pub fn lock_token(
        mut self,
        domain: StorageDomain,
        machine: impl StateMachine<LockTokenRequest> + 'static,
    ) -> Self {
        self.lock_token = Some(Registered::new(domain, machine));
        self
    }

    pub fn build(self) -> Result<StateMachines> {
        Ok(StateMachines {
            transactions: required(self.transactions, "transactions")?,
            id_allocation: required(self.id_allocation, "id allocation")?,
            labels: required(self.labels, "label tokens")?,
            relationship_types: required(self.relationship_types, "relationship type tokens")?,
            property_keys: required(self.property_keys, "property key tokens")?,
            lock_token: required(self.lock_token, "lock token")?,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::entry::{IdType, MemberId};
    use tempfile::TempDir;

    fn noop_callback() -> ResultCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_builder_requires_every_machine() {
        let journal = Journal::default();
        let result = StateMachines::builder()
            .transactions(StorageDomain::new("store"), Recorder::new("tx", &journal))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_watermark_is_minimum_over_distinct_domains() {
        let journal = Journal::default();
        let mut machines = recording_machines(&journal);

        machines
            .transactions()
            .apply_command(TransactionCommand::default(), 10, noop_callback())
            .unwrap();
        machines
            .id_allocation()
            .apply_command(
                IdAllocationRequest {
                    owner: MemberId::random(),
                    id_type: IdType::Node,
                    range_start: 0,
                    range_length: 10,
                },
                11,
                noop_callback(),
            )
            .unwrap();
        machines
            .lock_token()
            .apply_command(
                LockTokenRequest {
                    owner: MemberId::random(),
                    candidate_id: 0,
                },
                12,
                noop_callback(),
            )
            .unwrap();
        // nothing flushed yet
        assert_eq!(machines.last_applied_index(), 0);

        machines.flush_all().unwrap();
        // the token machines never applied anything but share the store watermark
        assert_eq!(machines.last_applied_index(), 10);
    }

    #[test]
    fn test_ensure_applied_targets_kind() {
        let journal = Journal::default();
        let mut machines = recording_machines(&journal);
        machines
            .ensure_applied(CommandKind::Token(TokenKind::PropertyKey))
            .unwrap();
        machines.ensure_applied(CommandKind::Noop).unwrap();
        assert_eq!(take(&journal), vec!["propkey.ensured"]);
    }

    #[test]
    fn test_only_transactions_batch() {
        let dir = TempDir::new().unwrap();
        let machines = StateMachines::open_standard(dir.path(), 10).unwrap();
        assert!(machines.batches(CommandKind::Transaction));
        assert!(!machines.batches(CommandKind::IdAllocation));
        assert!(!machines.batches(CommandKind::Token(TokenKind::Label)));
        assert!(!machines.batches(CommandKind::LockToken));
        assert!(!machines.batches(CommandKind::Noop));
    }

    #[test]
    fn test_standard_machines_recover_watermark() {
        let dir = TempDir::new().unwrap();
        {
            let mut machines = StateMachines::open_standard(dir.path(), 10).unwrap();
            machines
                .transactions()
                .apply_command(TransactionCommand::put("k", "v"), 3, noop_callback())
                .unwrap();
            machines
                .id_allocation()
                .apply_command(
                    IdAllocationRequest {
                        owner: MemberId::random(),
                        id_type: IdType::Node,
                        range_start: 0,
                        range_length: 8,
                    },
                    4,
                    noop_callback(),
                )
                .unwrap();
            machines
                .lock_token()
                .apply_command(
                    LockTokenRequest {
                        owner: MemberId::random(),
                        candidate_id: 0,
                    },
                    5,
                    noop_callback(),
                )
                .unwrap();
            machines.flush_all().unwrap();
            assert_eq!(machines.last_applied_index(), 3);
        }

        let machines = StateMachines::open_standard(dir.path(), 10).unwrap();
        assert_eq!(machines.last_applied_index(), 3);
    }
}
