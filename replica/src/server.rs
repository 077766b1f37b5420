use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use slog::o;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use replica::config::RuntimeConfig;
use replica::consensus::ConsensusStore;
use replica::entry::{
    Command, DistributedOperation, GlobalSession, IdAllocationRequest, IdType, LockTokenRequest,
    LogEntry, MemberId, OperationStamper, TokenKind, TokenRequest, TransactionCommand,
};
use replica::machines::{ApplyResult, StateMachines};
use replica::storage::FileLog;
use replica::{metrics, Engine, Health};

#[cfg(feature = "slog-term")]
const LOGGER_CHANNEL_SIZE: usize = 4096;
const ID_RANGE_LENGTH: u64 = 64;

#[cfg(feature = "slog-term")]
fn build_logger() -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

#[cfg(not(feature = "slog-term"))]
fn build_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

/// A single member: it is its own leader, so every appended entry commits right away
pub struct Server {
    member: MemberId,
    config: RuntimeConfig,
    term: u64,
    consensus: Option<ConsensusStore>,
    engine: Arc<Mutex<Engine>>,
    proposer: Option<tokio::task::JoinHandle<()>>,
}

impl Server {
    pub fn builder(config: RuntimeConfig) -> anyhow::Result<Self> {
        let member = config
            .member_id
            .map(MemberId)
            .unwrap_or_else(MemberId::random);
        let logger = build_logger().new(o!("tag" => format!("{}", member)));
        let health = Health::new();
        let engine_config = config.engine.clone();

        let log = Arc::new(
            FileLog::open(&config.log_dir, config.entries_per_segment)
                .context("failed to open the log")?,
        );
        let machines = StateMachines::open_standard(
            &engine_config.state_dir,
            engine_config.rotation_threshold,
        )
        .context("failed to open the state machines")?;

        // alone in the cluster: vote for ourselves in a fresh term
        let mut consensus = ConsensusStore::open(
            engine_config.state_dir.join("consensus"),
            engine_config.rotation_threshold,
            health.clone(),
        )?;
        let term = consensus.term().term() + 1;
        consensus.update_term(term)?;
        consensus.update_vote(Some(member), term)?;
        log::info!("{} leads term {}", member, term);

        let engine = Engine::new(engine_config, log, machines, health, &logger);
        Ok(Server {
            member,
            config,
            term,
            consensus: Some(consensus),
            engine: Arc::new(Mutex::new(engine)),
            proposer: None,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        {
            let mut engine = self.lock_engine();
            engine.start()?;
            let index = engine.log().append_index() + 1;
            engine.append(LogEntry::barrier(index, self.term))?;
            engine.commit(index)?;
        }
        self.start_metrics_server()?;
        self.start_proposer();
        Ok(())
    }

    pub fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(proposer) = self.proposer.take() {
            proposer.abort();
        }
        self.lock_engine().shutdown()?;
        if let Some(consensus) = self.consensus.take() {
            consensus.shutdown()?;
        }
        log::info!("server stop");
        Ok(())
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::error!("failed to encode metrics: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }

    /// Keeps proposing demo commands of every kind
    fn start_proposer(&mut self) {
        let interval = self.config.propose_interval_ms;
        if interval == 0 {
            return;
        }
        let member = self.member;
        let term = self.term;
        let engine = self.engine.clone();
        let mut stamper = OperationStamper::new(GlobalSession::new(member), 0);

        self.proposer = Some(tokio::spawn(async move {
            let mut counter = 0u64;
            loop {
                let operation = stamper.stamp(demo_command(member, counter));
                let waiter = {
                    let engine = engine.lock().unwrap_or_else(|e| e.into_inner());
                    match propose(&engine, term, operation) {
                        Ok(waiter) => waiter,
                        Err(e) => {
                            log::error!("failed to propose, stopping proposer: {}", e);
                            break;
                        }
                    }
                };
                match waiter.await {
                    Ok(result) => log::info!("proposal {} applied: {:?}", counter, result),
                    Err(_) => log::warn!("proposal {} produced no result", counter),
                }
                counter += 1;
                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        }));
    }
}

fn propose(
    engine: &Engine,
    term: u64,
    operation: DistributedOperation,
) -> replica::Result<oneshot::Receiver<ApplyResult>> {
    let index = engine.log().append_index() + 1;
    let waiter = engine.await_applied(index);
    engine.append(LogEntry::operation(index, term, operation))?;
    engine.commit(index)?;
    Ok(waiter)
}

fn demo_command(member: MemberId, counter: u64) -> Command {
    let round = counter / 4;
    match counter % 4 {
        0 => Command::Transaction(TransactionCommand::put(
            format!("key-{}", round % 16),
            counter.to_string(),
        )),
        1 => Command::Token(
            TokenKind::Label,
            TokenRequest {
                name: format!("Label{}", round % 8),
            },
        ),
        2 => Command::IdAllocation(IdAllocationRequest {
            owner: member,
            id_type: IdType::Node,
            range_start: round * ID_RANGE_LENGTH,
            range_length: ID_RANGE_LENGTH,
        }),
        _ => Command::LockToken(LockTokenRequest {
            owner: member,
            candidate_id: round,
        }),
    }
}
