//! Signal-driven shutdown.
//!
//! `ShutdownGuard` turns interrupt and terminate signals into exit decisions
//! based on whether work is in flight. Signals arrive through a
//! `SignalSource` so the state machine can be driven from tests; the OS
//! bridge forwards tokio signals into a crossbeam channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::{clog, clog_debug, clog_error, clog_warn, Result};

/// Two interrupts closer together than this force an exit.
pub const FORCE_WINDOW: Duration = Duration::from_secs(1);

pub const EXIT_OK: i32 = 0;
pub const EXIT_INTERRUPTED: i32 = 130;
pub const EXIT_EMERGENCY: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Normal,
    /// The graceful sequence is running and waiting on its hooks.
    ConfirmationPending,
    Executing,
    ForceExit,
}

/// What the caller should do after a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Exit(i32),
    Block,
}

/// Anything that can report how many tasks are running.
pub trait InFlight: Send + Sync {
    fn in_flight(&self) -> usize;
}

impl InFlight for crate::orchestration::WorkerPool {
    fn in_flight(&self) -> usize {
        crate::orchestration::WorkerPool::in_flight(self)
    }
}

/// Callbacks run on the way out.
pub trait ShutdownHooks: Send + Sync {
    fn save_state(&self) -> Result<()>;
    fn stop_executions(&self);
    /// Best-effort synchronous save on the emergency path. Must not block
    /// on in-flight work.
    fn emergency_save(&self);
}

/// Blocking source of signals. `None` means the source is closed.
pub trait SignalSource {
    fn next_signal(&self) -> Option<Signal>;
}

impl SignalSource for Receiver<Signal> {
    fn next_signal(&self) -> Option<Signal> {
        self.recv().ok()
    }
}

struct Inner {
    state: GuardState,
    last_interrupt: Option<Instant>,
}

pub struct ShutdownGuard {
    work: Arc<dyn InFlight>,
    hooks: Arc<dyn ShutdownHooks>,
    inner: Mutex<Inner>,
}

impl ShutdownGuard {
    pub fn new(work: Arc<dyn InFlight>, hooks: Arc<dyn ShutdownHooks>) -> Self {
        Self {
            work,
            hooks,
            inner: Mutex::new(Inner {
                state: GuardState::Normal,
                last_interrupt: None,
            }),
        }
    }

    pub fn state(&self) -> GuardState {
        self.lock().state
    }

    pub fn handle(&self, signal: Signal) -> Decision {
        self.handle_at(signal, Instant::now())
    }

    /// Apply `signal` as if it arrived at `now`.
    pub fn handle_at(&self, signal: Signal, now: Instant) -> Decision {
        clog_debug!("ShutdownGuard::handle {:?} state={:?}", signal, self.state());
        match signal {
            Signal::Interrupt => self.interrupt(now),
            Signal::Terminate => self.graceful(),
        }
    }

    fn interrupt(&self, now: Instant) -> Decision {
        let in_flight = self.work.in_flight();
        let mut inner = self.lock();

        if inner.state == GuardState::ForceExit {
            return Decision::Exit(EXIT_INTERRUPTED);
        }
        if in_flight == 0 {
            inner.state = GuardState::Normal;
            clog!("Interrupt with no work in flight, exiting");
            return Decision::Exit(EXIT_INTERRUPTED);
        }

        let repeated = inner
            .last_interrupt
            .is_some_and(|prev| now.saturating_duration_since(prev) <= FORCE_WINDOW);
        if repeated {
            inner.state = GuardState::ForceExit;
            clog_warn!("Second interrupt, forcing exit with {} task(s) in flight", in_flight);
            return Decision::Exit(EXIT_INTERRUPTED);
        }

        inner.state = GuardState::Executing;
        inner.last_interrupt = Some(now);
        clog_warn!(
            "{} task(s) still running; interrupt again within {}s to force exit",
            in_flight,
            FORCE_WINDOW.as_secs()
        );
        Decision::Block
    }

    /// Save state, stop executions, exit cleanly.
    fn graceful(&self) -> Decision {
        self.lock().state = GuardState::ConfirmationPending;
        clog!("Terminate received, shutting down gracefully");
        if let Err(e) = self.hooks.save_state() {
            clog_warn!("Saving state during shutdown failed: {}", e);
        }
        self.hooks.stop_executions();
        self.lock().state = GuardState::ForceExit;
        Decision::Exit(EXIT_OK)
    }

    /// Emergency path for panics and unhandled errors. Never runs the
    /// graceful sequence.
    pub fn emergency(&self, reason: &str) -> i32 {
        self.lock().state = GuardState::ForceExit;
        emergency_exit_code(self.hooks.as_ref(), reason)
    }

    /// Feed signals from `source` until one of them decides to exit.
    ///
    /// A closed source ends the loop with a clean exit code.
    pub fn run<S: SignalSource>(&self, source: &S) -> i32 {
        while let Some(signal) = source.next_signal() {
            if let Decision::Exit(code) = self.handle(signal) {
                return code;
            }
        }
        EXIT_OK
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn emergency_exit_code(hooks: &dyn ShutdownHooks, reason: &str) -> i32 {
    clog_error!("Emergency shutdown: {}", reason);
    hooks.emergency_save();
    EXIT_EMERGENCY
}

/// Route panics through the emergency save, then exit hard.
pub fn install_panic_hook(hooks: Arc<dyn ShutdownHooks>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        let code = emergency_exit_code(hooks.as_ref(), &info.to_string());
        std::process::exit(code);
    }));
}

/// Forward OS interrupt and terminate signals into `tx` until the receiver
/// goes away.
pub async fn forward_os_signals(tx: Sender<Signal>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        loop {
            let next = tokio::select! {
                r = tokio::signal::ctrl_c() => r.map(|_| Signal::Interrupt)?,
                _ = terminate.recv() => Signal::Terminate,
            };
            if tx.send(next).is_err() {
                return Ok(());
            }
        }
    }
    #[cfg(not(unix))]
    {
        loop {
            tokio::signal::ctrl_c().await?;
            if tx.send(Signal::Interrupt).is_err() {
                return Ok(());
            }
        }
    }
}
