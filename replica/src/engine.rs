//! Engine facade
//!
//! Wires the log, the in-flight cache and the applier together. Transport appends
//! entries and reports commits; a dedicated worker thread applies them.

use slog::{info, o, warn, Logger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{oneshot, watch};

use crate::apply::{Applier, ProgressTracker};
use crate::cache::InFlightCache;
use crate::config::EngineConfig;
use crate::entry::LogEntry;
use crate::error::{Error, Result};
use crate::health::Health;
use crate::machines::{ApplyResult, StateMachines};
use crate::storage::ReplicatedLog;

/// Watermarks published by the worker after every pass
#[derive(Debug, Default)]
struct Watermarks {
    applied: AtomicU64,
    durable: AtomicU64,
}

impl Watermarks {
    fn publish(&self, applier: &Applier) {
        self.applied.store(applier.last_applied(), Ordering::Release);
        self.durable
            .store(applier.last_applied_index(), Ordering::Release);
    }
}

pub struct Engine {
    config: EngineConfig,
    log: Arc<dyn ReplicatedLog>,
    cache: Arc<InFlightCache>,
    progress: Arc<ProgressTracker>,
    health: Health,
    logger: Logger,
    watermarks: Arc<Watermarks>,
    commit_tx: watch::Sender<u64>,
    commit_rx: watch::Receiver<u64>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    machines: Option<StateMachines>,
    worker: Option<JoinHandle<Result<Applier>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        log: Arc<dyn ReplicatedLog>,
        machines: StateMachines,
        health: Health,
        logger: &Logger,
    ) -> Self {
        let (commit_tx, commit_rx) = watch::channel(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Engine {
            cache: Arc::new(InFlightCache::new(config.in_flight_cache.clone())),
            config,
            log,
            progress: Arc::new(ProgressTracker::new()),
            health,
            logger: logger.new(o!("tag" => "engine")),
            watermarks: Arc::default(),
            commit_tx,
            commit_rx,
            shutdown_tx,
            shutdown_rx,
            machines: Some(machines),
            worker: None,
        }
    }

    /// Recovers, replays everything committed so far, then starts the worker
    pub fn start(&mut self) -> Result<()> {
        let machines = self.machines.take().ok_or(Error::AlreadyStarted)?;
        let mut applier = Applier::open(
            &self.config,
            self.log.clone(),
            self.cache.clone(),
            machines,
            self.progress.clone(),
            self.health.clone(),
            &self.logger,
        )?;

        let committed = self.log.committed_index();
        info!(self.logger, "replaying committed entries";
            "from" => applier.last_applied() + 1, "to" => committed);
        applier.apply_up_to(committed)?;
        self.watermarks.publish(&applier);
        self.notify_committed(committed);

        let log = self.log.clone();
        let commit_rx = self.commit_rx.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let watermarks = self.watermarks.clone();
        let handle = thread::Builder::new()
            .name("replica-applier".to_string())
            .spawn(move || run_worker(applier, log, commit_rx, shutdown_rx, watermarks))?;
        self.worker = Some(handle);
        info!(self.logger, "engine started"; "applied" => self.applied_index());
        Ok(())
    }

    /// Appends to the log and keeps the entry in memory until it is applied. Wakes the
    /// worker if the commit notification ran ahead of the local log.
    pub fn append(&self, entry: LogEntry) -> Result<u64> {
        self.health.ensure_healthy()?;
        let index = self.log.append(entry.clone())?;
        self.cache.register(index, entry);
        let notified_ahead = *self.commit_tx.borrow() >= index;
        if notified_ahead {
            self.commit_tx.send_modify(|_| {});
        }
        Ok(index)
    }

    /// Advances the log's commit index and wakes the worker
    pub fn commit(&self, index: u64) -> Result<()> {
        self.log.commit(index)?;
        self.notify_committed(index);
        Ok(())
    }

    /// Schedules application up to `index`. Never applies inline; lower or equal
    /// values are ignored and pending notifications coalesce. An index the log does not
    /// hold yet stays pending until it is appended.
    pub fn notify_committed(&self, index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    /// Highest index notified as committed
    pub fn notified_index(&self) -> u64 {
        *self.commit_rx.borrow()
    }

    /// Safe log truncation point: the minimum durable index over storage domains
    pub fn last_applied_index(&self) -> u64 {
        self.watermarks.durable.load(Ordering::Acquire)
    }

    /// Highest index handed to the state machines
    pub fn applied_index(&self) -> u64 {
        self.watermarks.applied.load(Ordering::Acquire)
    }

    /// Receives the result of the command at `index`. Register before the entry is
    /// committed; the channel closes without a value if the entry produces no result
    /// or the engine halts.
    pub fn await_applied(&self, index: u64) -> oneshot::Receiver<ApplyResult> {
        self.progress.register(index)
    }

    /// Drops uncommitted entries from `from` on
    pub fn truncate(&self, from: u64) -> Result<()> {
        self.log.truncate(from)?;
        self.cache.truncate(from);
        Ok(())
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    /// Waits for the current pass, checkpoints if healthy and closes the stores
    pub fn shutdown(&mut self) -> Result<()> {
        let mut applier = self.stop_worker()?.ok_or(Error::NotRunning)?;
        if self.health.is_healthy() {
            applier.checkpoint()?;
            self.watermarks.publish(&applier);
        } else {
            warn!(self.logger, "unhealthy, skipping final checkpoint";
                "last_flushed" => applier.last_flushed());
        }
        applier.close()?;
        info!(self.logger, "engine stopped"; "applied" => self.applied_index());
        Ok(())
    }

    fn stop_worker(&mut self) -> Result<Option<Applier>> {
        let handle = match self.worker.take() {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let _ = self.shutdown_tx.send(true);
        let applier = handle
            .join()
            .map_err(|_| Error::Machine("applier worker panicked".to_string()))??;
        Ok(Some(applier))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // no checkpoint: the next start replays from the last one
        if let Err(e) = self.stop_worker() {
            log::error!("failed to stop applier worker: {}", e);
        }
    }
}

fn run_worker(
    mut applier: Applier,
    log: Arc<dyn ReplicatedLog>,
    mut commit_rx: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
    watermarks: Arc<Watermarks>,
) -> Result<Applier> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let notified = *commit_rx.borrow_and_update();
            let target = notified.min(log.append_index());
            if target > applier.last_applied() {
                let result = applier.apply_up_to(target);
                watermarks.publish(&applier);
                // the applier already flagged health and released the waiters
                if result.is_err() {
                    break;
                }
                continue;
            }
            tokio::select! {
                biased;
                res = shutdown_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = commit_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(applier)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::entry::{
        Command, GlobalSession, IdAllocationRequest, IdType, LockTokenRequest, MemberId,
        OperationStamper, TokenKind, TokenRequest, TransactionCommand,
    };
    use crate::machines::testing::{recording_machines, recording_machines_with, Journal, Recorder};
    use crate::machines::{ApplyOutcome, TransactionStore};
    use crate::storage::{FileLog, MemoryLog};
    use tempfile::TempDir;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn config(dir: &TempDir, flush_every: u64, cache: CacheConfig) -> EngineConfig {
        EngineConfig {
            state_dir: dir.path().join("state"),
            rotation_threshold: 16,
            flush_every,
            in_flight_cache: cache,
        }
    }

    fn tx(value: &str) -> Command {
        Command::Transaction(TransactionCommand::put("k", value))
    }

    /// Appends `commands`, commits them and waits for the last result
    fn propose(
        engine: &Engine,
        stamper: &mut OperationStamper,
        commands: Vec<Command>,
    ) -> Vec<ApplyResult> {
        let mut waiters = Vec::new();
        let mut last = 0;
        for command in commands {
            let index = engine.log().append_index() + 1;
            waiters.push(engine.await_applied(index));
            last = engine
                .append(LogEntry::operation(index, 1, stamper.stamp(command)))
                .unwrap();
        }
        engine.commit(last).unwrap();
        waiters
            .into_iter()
            .map(|w| w.blocking_recv().unwrap())
            .collect()
    }

    fn stamper() -> OperationStamper {
        OperationStamper::new(GlobalSession::new(MemberId::random()), 0)
    }

    #[test]
    fn test_end_to_end_with_standard_machines() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 100, CacheConfig::default());
        let machines = StateMachines::open_standard(&config.state_dir, 16).unwrap();
        let mut engine = Engine::new(
            config,
            Arc::new(MemoryLog::new()),
            machines,
            Health::new(),
            &discard(),
        );
        engine.start().unwrap();

        let owner = MemberId::random();
        let results = propose(
            &engine,
            &mut stamper(),
            vec![
                tx("v"),
                Command::Token(TokenKind::Label, TokenRequest { name: "Person".into() }),
                Command::IdAllocation(IdAllocationRequest {
                    owner,
                    id_type: IdType::Node,
                    range_start: 0,
                    range_length: 1024,
                }),
                Command::LockToken(LockTokenRequest {
                    owner,
                    candidate_id: 0,
                }),
            ],
        );
        assert_eq!(
            results,
            vec![
                Ok(ApplyOutcome::Committed { index: 1 }),
                Ok(ApplyOutcome::TokenId(0)),
                Ok(ApplyOutcome::IdRangeGranted(true)),
                Ok(ApplyOutcome::LockTokenGranted(true)),
            ]
        );

        engine.shutdown().unwrap();
        assert_eq!(engine.applied_index(), 4);
        // the shared store saw index 2 last, the other domains 3 and 4
        assert_eq!(engine.last_applied_index(), 2);
        assert!(matches!(engine.shutdown(), Err(Error::NotRunning)));
        assert!(matches!(engine.start(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn test_restart_after_crash_replays_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("log");
        let mut stamper = stamper();
        {
            let config = config(&dir, 2, CacheConfig::default());
            let machines = StateMachines::open_standard(&config.state_dir, 16).unwrap();
            let log = Arc::new(FileLog::open(&log_dir, 4).unwrap());
            let mut engine = Engine::new(config, log, machines, Health::new(), &discard());
            engine.start().unwrap();
            let commands = (1..=5).map(|i| tx(&i.to_string())).collect();
            propose(&engine, &mut stamper, commands);
            // dropped without shutdown
        }

        let config = config(&dir, 2, CacheConfig::default());
        let machines = StateMachines::open_standard(&config.state_dir, 16).unwrap();
        let log = Arc::new(FileLog::open(&log_dir, 4).unwrap());
        let mut engine = Engine::new(config, log, machines, Health::new(), &discard());
        engine.start().unwrap();
        assert_eq!(engine.applied_index(), 5);

        // the session tracker survived: the same stamper keeps going
        let results = propose(&engine, &mut stamper, vec![tx("6")]);
        assert_eq!(results, vec![Ok(ApplyOutcome::Committed { index: 6 })]);
        engine.shutdown().unwrap();

        let store = TransactionStore::open(dir.path().join("state"), 16).unwrap();
        assert_eq!(store.flushed_index(), 6);
        assert_eq!(store.get(b"k"), Some(&b"6"[..]));
    }

    #[test]
    fn test_evicted_entries_are_read_from_log() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::default();
        let log = Arc::new(MemoryLog::new());
        let cache = CacheConfig {
            enabled: true,
            max_entries: 2,
        };
        let mut engine = Engine::new(
            config(&dir, 100, cache),
            log.clone(),
            recording_machines(&journal),
            Health::new(),
            &discard(),
        );
        engine.start().unwrap();

        let commands = (1..=5).map(|i| tx(&i.to_string())).collect();
        propose(&engine, &mut stamper(), commands);
        assert_eq!(log.reads(), 3);

        let commands = (6..=7).map(|i| tx(&i.to_string())).collect();
        propose(&engine, &mut stamper(), commands);
        assert_eq!(log.reads(), 3);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_machine_failure_halts_engine() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::default();
        let machines =
            recording_machines_with(&journal, Recorder::new("tx", &journal).failing_at(3));
        let mut engine = Engine::new(
            config(&dir, 100, CacheConfig::default()),
            Arc::new(MemoryLog::new()),
            machines,
            Health::new(),
            &discard(),
        );
        engine.start().unwrap();

        let mut stamper = stamper();
        let mut waiters = Vec::new();
        for i in 1..=4 {
            waiters.push(engine.await_applied(i));
            engine
                .append(LogEntry::operation(i, 1, stamper.stamp(tx("x"))))
                .unwrap();
        }
        engine.commit(4).unwrap();

        let results: Vec<_> = waiters.into_iter().map(|w| w.blocking_recv()).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
        assert!(results[3].is_err());
        assert!(!engine.health().is_healthy());

        let next = LogEntry::operation(5, 1, stamper.stamp(tx("y")));
        assert!(matches!(engine.append(next), Err(Error::Unhealthy(_))));
        engine.shutdown().unwrap();
        // entries before the failing one were applied and stay visible
        assert_eq!(engine.applied_index(), 2);
    }

    #[test]
    fn test_commit_notified_before_append_waits_for_entries() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::default();
        let mut engine = Engine::new(
            config(&dir, 100, CacheConfig::default()),
            Arc::new(MemoryLog::new()),
            recording_machines(&journal),
            Health::new(),
            &discard(),
        );
        engine.start().unwrap();

        // a follower can learn the commit index before the entries reach it
        engine.notify_committed(2);
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(engine.health().is_healthy());
        assert_eq!(engine.applied_index(), 0);

        let mut stamper = stamper();
        let first = engine.await_applied(1);
        let second = engine.await_applied(2);
        engine
            .append(LogEntry::operation(1, 1, stamper.stamp(tx("a"))))
            .unwrap();
        assert_eq!(
            first.blocking_recv().unwrap(),
            Ok(ApplyOutcome::Committed { index: 1 })
        );
        engine
            .append(LogEntry::operation(2, 1, stamper.stamp(tx("b"))))
            .unwrap();
        engine.commit(2).unwrap();
        assert_eq!(
            second.blocking_recv().unwrap(),
            Ok(ApplyOutcome::Committed { index: 2 })
        );
        assert!(engine.health().is_healthy());
        engine.shutdown().unwrap();
        assert_eq!(engine.applied_index(), 2);
    }

    #[test]
    fn test_notify_committed_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::default();
        let engine = Engine::new(
            config(&dir, 100, CacheConfig::default()),
            Arc::new(MemoryLog::new()),
            recording_machines(&journal),
            Health::new(),
            &discard(),
        );
        engine.notify_committed(5);
        engine.notify_committed(3);
        engine.notify_committed(5);
        assert_eq!(engine.notified_index(), 5);
        engine.notify_committed(8);
        assert_eq!(engine.notified_index(), 8);
    }

    #[test]
    fn test_truncate_drops_cached_entries() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::default();
        let log = Arc::new(MemoryLog::new());
        let mut engine = Engine::new(
            config(&dir, 100, CacheConfig::default()),
            log.clone(),
            recording_machines(&journal),
            Health::new(),
            &discard(),
        );
        engine.start().unwrap();
        let mut stamper = stamper();
        for i in 1..=3 {
            engine
                .append(LogEntry::operation(i, 1, stamper.stamp(tx("old"))))
                .unwrap();
        }
        engine.truncate(2).unwrap();
        assert_eq!(log.append_index(), 1);

        // a new leader rewrites index 2
        let rewritten = GlobalSession::new(MemberId::random());
        let mut other = OperationStamper::new(rewritten, 0);
        let waiter = engine.await_applied(2);
        engine
            .append(LogEntry::operation(2, 2, other.stamp(tx("new"))))
            .unwrap();
        engine.commit(2).unwrap();
        assert_eq!(
            waiter.blocking_recv().unwrap(),
            Ok(ApplyOutcome::Committed { index: 2 })
        );
        assert_eq!(log.reads(), 0);
        engine.shutdown().unwrap();
    }
}
