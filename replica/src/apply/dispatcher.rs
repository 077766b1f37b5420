use crate::entry::{Command, CommandKind};
use crate::error::Result;
use crate::machines::{ApplyOutcome, ResultCallback, StateMachines};
use crate::metrics;

/// Routes commands to their state machine, batching consecutive commands of one kind.
///
/// Only machines that buffer open a batch. It stays open until a command of another
/// kind, a barrier, or the end of the pass seals it with `ensure_applied`. Dropping the
/// dispatcher seals the open batch too, so a pass that bails out early still completes
/// what it already handed over.
pub struct Dispatcher<'a> {
    machines: &'a mut StateMachines,
    open: Option<CommandKind>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(machines: &'a mut StateMachines) -> Self {
        Dispatcher {
            machines,
            open: None,
        }
    }

    pub fn dispatch(&mut self, command: Command, index: u64, callback: ResultCallback) -> Result<()> {
        let kind = command.kind();
        if self.open != Some(kind) {
            self.seal()?;
        }
        metrics::APPLIED_COUNTER_VEC
            .with_label_values(&[kind.label()])
            .inc();

        if let Command::Noop = command {
            callback(Ok(ApplyOutcome::Noop));
            return Ok(());
        }
        if self.machines.batches(kind) {
            self.open = Some(kind);
        }
        match command {
            Command::Transaction(tx) => self
                .machines
                .transactions()
                .apply_command(tx, index, callback),
            Command::IdAllocation(request) => self
                .machines
                .id_allocation()
                .apply_command(request, index, callback),
            Command::Token(token_kind, request) => self
                .machines
                .tokens(token_kind)
                .apply_command(request, index, callback),
            Command::LockToken(request) => self
                .machines
                .lock_token()
                .apply_command(request, index, callback),
            Command::Noop => Ok(()),
        }
    }

    /// A structural entry: nothing to apply, but no batch may span it
    pub fn barrier(&mut self) -> Result<()> {
        self.seal()
    }

    /// Completes the open batch, if any
    pub fn seal(&mut self) -> Result<()> {
        if let Some(kind) = self.open.take() {
            self.machines.ensure_applied(kind)?;
            metrics::BATCH_COUNTER_VEC
                .with_label_values(&[kind.label()])
                .inc();
        }
        Ok(())
    }

    /// Seals the open batch and flushes every machine
    pub fn flush_machines(&mut self) -> Result<()> {
        self.seal()?;
        self.machines.flush_all()
    }

    pub fn close(mut self) -> Result<()> {
        self.seal()
    }
}

impl Drop for Dispatcher<'_> {
    fn drop(&mut self) {
        if let Some(kind) = self.open {
            if let Err(e) = self.seal() {
                log::error!("failed to seal {} batch on release: {}", kind.label(), e);
            }
        }
    }
}
