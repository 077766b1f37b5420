use slog::{debug, error, info, o, Logger};
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::progress::ProgressTracker;
use super::session::SessionTracker;
use crate::cache::InFlightCache;
use crate::config::EngineConfig;
use crate::entry::{Content, LogEntry};
use crate::error::{Error, Result};
use crate::health::Health;
use crate::machines::StateMachines;
use crate::metrics;
use crate::storage::{BincodeMarshal, DurableStore, IndexMarshal, ReplicatedLog};

const SESSION_SLOT: &str = "session-tracker";
const WATERMARK_SLOT: &str = "last-flushed";

/// Durable state written at every checkpoint
struct Checkpoint {
    sessions: DurableStore<SessionTracker, BincodeMarshal>,
    last_flushed: DurableStore<u64, IndexMarshal>,
}

impl Checkpoint {
    fn last_flushed(&self) -> u64 {
        *self.last_flushed.state()
    }

    /// Machines first, then sessions, then the watermark. A crash in between leaves
    /// the watermark behind durable state, which replay tolerates.
    fn write(
        &mut self,
        dispatcher: &mut Dispatcher<'_>,
        sessions: &SessionTracker,
        index: u64,
    ) -> Result<()> {
        metrics::record_checkpoint(|| {
            dispatcher.flush_machines()?;
            self.sessions.persist(sessions.clone())?;
            self.last_flushed.persist(index)
        })
    }
}

/// Applies committed entries to the state machines, strictly in index order.
///
/// Owned by a single worker. Any failure halts it for good and flips the shared health
/// flag: a member that failed to apply an entry may have diverged from its peers.
pub struct Applier {
    log: Arc<dyn ReplicatedLog>,
    cache: Arc<InFlightCache>,
    machines: StateMachines,
    sessions: SessionTracker,
    checkpoint: Checkpoint,
    progress: Arc<ProgressTracker>,
    health: Health,
    logger: Logger,
    flush_every: u64,
    last_applied: u64,
}

impl Applier {
    /// Recovers the session tracker and the last checkpointed index from `state_dir`
    pub fn open(
        config: &EngineConfig,
        log: Arc<dyn ReplicatedLog>,
        cache: Arc<InFlightCache>,
        machines: StateMachines,
        progress: Arc<ProgressTracker>,
        health: Health,
        logger: &Logger,
    ) -> Result<Self> {
        if config.flush_every == 0 {
            return Err(Error::Config("flush_every must be positive".into()));
        }
        let sessions = DurableStore::open(
            &config.state_dir,
            SESSION_SLOT,
            SessionTracker::new(),
            config.rotation_threshold,
            BincodeMarshal,
        )?;
        let last_flushed = DurableStore::open(
            &config.state_dir,
            WATERMARK_SLOT,
            0,
            config.rotation_threshold,
            IndexMarshal,
        )?;
        let logger = logger.new(o!("tag" => "applier"));
        let last_applied = last_flushed.initial_state();
        info!(logger, "recovered applier state";
            "last_flushed" => last_applied,
            "sessions_index" => sessions.state().last_index(),
            "machines_watermark" => machines.last_applied_index());

        Ok(Applier {
            log,
            cache,
            machines,
            sessions: sessions.initial_state(),
            checkpoint: Checkpoint {
                sessions,
                last_flushed,
            },
            progress,
            health,
            logger,
            flush_every: config.flush_every,
            last_applied,
        })
    }

    /// Highest index handed to the state machines
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Highest index covered by a completed checkpoint
    pub fn last_flushed(&self) -> u64 {
        self.checkpoint.last_flushed()
    }

    /// Minimum durable index across storage domains, the safe log truncation point
    pub fn last_applied_index(&self) -> u64 {
        self.machines.last_applied_index()
    }

    /// Applies every entry in `(last_applied, target]`. On failure the process is marked
    /// unhealthy, pending waiters are released and the error is returned.
    pub fn apply_up_to(&mut self, target: u64) -> Result<()> {
        if target <= self.last_applied {
            return Ok(());
        }
        self.health.ensure_healthy()?;
        let result = self.apply_range(target);
        if let Err(e) = &result {
            error!(self.logger, "apply failed, halting";
                "index" => self.last_applied + 1, "error" => %e);
            self.health.mark_unhealthy(format!(
                "failed to apply entry {}: {}",
                self.last_applied + 1,
                e
            ));
            self.progress.abort_all();
        }
        result
    }

    fn apply_range(&mut self, target: u64) -> Result<()> {
        let Applier {
            log,
            cache,
            machines,
            sessions,
            checkpoint,
            progress,
            logger,
            flush_every,
            last_applied,
            ..
        } = self;

        let mut dispatcher = Dispatcher::new(machines);
        while *last_applied < target {
            let index = *last_applied + 1;
            let entry = read_entry(&**log, cache, index, logger)?;

            match entry.content {
                Content::Operation(operation) => {
                    if sessions.validate_operation(&operation.global_session, &operation.operation_id) {
                        sessions.update(operation.global_session, operation.operation_id, index);
                        dispatcher.dispatch(operation.command, index, progress.callback(index))?;
                    } else {
                        metrics::DUPLICATE_COUNTER.inc();
                        debug!(logger, "skipping duplicate operation";
                            "index" => index,
                            "owner" => %operation.global_session.owner,
                            "sequence" => operation.operation_id.sequence_number);
                        progress.discard(index);
                    }
                }
                Content::NewLeaderBarrier => {
                    dispatcher.barrier()?;
                    progress.discard(index);
                }
            }
            *last_applied = index;

            if index - checkpoint.last_flushed() >= *flush_every {
                checkpoint.write(&mut dispatcher, sessions, index)?;
                debug!(logger, "checkpoint"; "index" => index);
            }
        }
        dispatcher.close()?;
        cache.prune(*last_applied);
        Ok(())
    }

    /// Flushes everything applied since the last checkpoint
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.last_applied <= self.checkpoint.last_flushed() {
            return Ok(());
        }
        let mut dispatcher = Dispatcher::new(&mut self.machines);
        self.checkpoint
            .write(&mut dispatcher, &self.sessions, self.last_applied)?;
        dispatcher.close()?;
        info!(self.logger, "checkpoint"; "index" => self.last_applied);
        Ok(())
    }

    /// Forces and closes the applier's durable stores
    pub fn close(self) -> Result<()> {
        self.checkpoint.sessions.shutdown()?;
        self.checkpoint.last_flushed.shutdown()
    }
}

/// Cache first, the log on a miss
fn read_entry(
    log: &dyn ReplicatedLog,
    cache: &InFlightCache,
    index: u64,
    logger: &Logger,
) -> Result<LogEntry> {
    let entry = match cache.retrieve(index) {
        Some(entry) => {
            cache.unregister(index);
            Arc::try_unwrap(entry).unwrap_or_else(|shared| (*shared).clone())
        }
        None => {
            debug!(logger, "in-flight cache miss, reading log"; "index" => index);
            log.entry_at(index)?
        }
    };
    if entry.index != index {
        return Err(Error::Machine(format!(
            "entry read at index {} claims index {}",
            index, entry.index
        )));
    }
    Ok(entry)
}
