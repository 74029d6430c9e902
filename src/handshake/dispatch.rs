use crate::{
    cas,
    handshake::{
        phase::{Signum, WeakSignal},
        record::MutatorRecord,
        Shared,
    },
    stats,
};
use std::sync::atomic::Ordering::SeqCst;

/// The per-phase work a mutator performs when a phase reaches it, e.g. scanning its stack for the
/// mark phase.
///
/// With [`DeliveryMode::Signal`](crate::config::DeliveryMode::Signal) the action runs inside a
/// signal handler on the mutator's own thread: it must be async-signal-safe, must not block on
/// anything the interrupted code could hold, and panicking aborts the process.
pub trait PhaseAction: Send + Sync + 'static {
    /// Performs the work for `phase` (never a deferred variant) on behalf of `record`'s thread.
    fn on_phase(&self, record: &MutatorRecord, phase: Signum);
}

impl<F> PhaseAction for F
where
    F: Fn(&MutatorRecord, Signum) + Send + Sync + 'static,
{
    #[inline]
    fn on_phase(&self, record: &MutatorRecord, phase: Signum) {
        self(record, phase)
    }
}

/// A [`PhaseAction`] that does nothing. Mutators just acknowledge phases.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoAction;

impl PhaseAction for NoAction {
    #[inline]
    fn on_phase(&self, _: &MutatorRecord, _: Signum) {}
}

/// Handles the phase in `record`'s mailbox on the owning thread.
///
/// This is the body of the phase signal handler: no logging, no allocation, no locks.
pub(crate) fn deliver(shared: &Shared, record: &MutatorRecord) {
    if unlikely!(record.is_dead()) {
        return;
    }
    let phase = record.mailbox.load();
    match phase {
        Signum::Init => return,
        Signum::Async if record.mark_signal_disabled() => {
            if record.mark_signal_requested.swap(phase) != phase {
                stats::deferred_signals()
            }
            return;
        }
        Signum::Sweep if record.sweep_signal_disabled() => {
            if !record.sweep_signal_requested.swap(true, SeqCst) {
                stats::deferred_signals()
            }
            return;
        }
        _ => {}
    }

    let primary = phase.primary();
    let weak = record.weak_signal();
    // a veto owes the action even for a phase already acknowledged through the barrier
    if record.status() == primary && weak != WeakSignal::DoHandshake {
        return;
    }
    if weak != WeakSignal::InBarrier {
        shared.action.on_phase(record, primary);
    }
    let _ = cas::change(
        &record.weak_signal,
        WeakSignal::DoHandshake,
        WeakSignal::InBarrier,
    );
    record.status.store(primary);
}
