//! Replicated log entry model
//!
//! Entries are immutable once appended. The applier consumes them in index order and
//! routes the commands they carry to the state machine responsible for each kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn random() -> Self {
        MemberId(Uuid::new_v4())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", &self.0.to_string()[..8])
    }
}

/// A session owned by one member, replaced whenever that member restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalSession {
    pub session_id: Uuid,
    pub owner: MemberId,
}

impl GlobalSession {
    pub fn new(owner: MemberId) -> Self {
        GlobalSession {
            session_id: Uuid::new_v4(),
            owner,
        }
    }
}

/// Position of an operation inside a local session of its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalOperationId {
    pub local_session_id: u64,
    pub sequence_number: u64,
}

impl LocalOperationId {
    pub fn new(local_session_id: u64, sequence_number: u64) -> Self {
        LocalOperationId {
            local_session_id,
            sequence_number,
        }
    }
}

/// A key write carried by a transaction. `None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionCommand {
    pub writes: Vec<Write>,
}

impl TransactionCommand {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        TransactionCommand {
            writes: vec![Write {
                key: key.into(),
                value: Some(value.into()),
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdType {
    Node,
    Relationship,
    Property,
}

/// Request for exclusive ownership of `[range_start, range_start + range_length)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocationRequest {
    pub owner: MemberId,
    pub id_type: IdType,
    pub range_start: u64,
    pub range_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenKind {
    Label,
    RelationshipType,
    PropertyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub name: String,
}

/// Request to take over the cluster lock token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTokenRequest {
    pub owner: MemberId,
    pub candidate_id: u64,
}

/// The finite set of replicated commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Transaction(TransactionCommand),
    IdAllocation(IdAllocationRequest),
    Token(TokenKind, TokenRequest),
    LockToken(LockTokenRequest),
    /// Carries nothing, used to probe the replication path
    Noop,
}

/// Unit of dispatch batching. Consecutive commands of one kind share a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Transaction,
    IdAllocation,
    Token(TokenKind),
    LockToken,
    Noop,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Transaction(_) => CommandKind::Transaction,
            Command::IdAllocation(_) => CommandKind::IdAllocation,
            Command::Token(kind, _) => CommandKind::Token(*kind),
            Command::LockToken(_) => CommandKind::LockToken,
            Command::Noop => CommandKind::Noop,
        }
    }
}

impl CommandKind {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::Transaction => "transaction",
            CommandKind::IdAllocation => "id_allocation",
            CommandKind::Token(TokenKind::Label) => "token_label",
            CommandKind::Token(TokenKind::RelationshipType) => "token_relationship_type",
            CommandKind::Token(TokenKind::PropertyKey) => "token_property_key",
            CommandKind::LockToken => "lock_token",
            CommandKind::Noop => "noop",
        }
    }
}

/// A command stamped with the session it was submitted in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedOperation {
    pub global_session: GlobalSession,
    pub operation_id: LocalOperationId,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Operation(DistributedOperation),
    /// Marks a new leadership term. Occupies an index, carries no command.
    NewLeaderBarrier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub content: Content,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, content: Content) -> Self {
        LogEntry {
            index,
            term,
            content,
        }
    }

    pub fn operation(index: u64, term: u64, operation: DistributedOperation) -> Self {
        LogEntry::new(index, term, Content::Operation(operation))
    }

    pub fn barrier(index: u64, term: u64) -> Self {
        LogEntry::new(index, term, Content::NewLeaderBarrier)
    }
}

/// Hands out consecutive operation ids for one local session of a member
#[derive(Debug)]
pub struct OperationStamper {
    global_session: GlobalSession,
    local_session_id: u64,
    next_sequence: u64,
}

impl OperationStamper {
    pub fn new(global_session: GlobalSession, local_session_id: u64) -> Self {
        OperationStamper {
            global_session,
            local_session_id,
            next_sequence: 0,
        }
    }

    pub fn stamp(&mut self, command: Command) -> DistributedOperation {
        let operation_id = LocalOperationId::new(self.local_session_id, self.next_sequence);
        self.next_sequence += 1;
        DistributedOperation {
            global_session: self.global_session,
            operation_id,
            command,
        }
    }
}
