mod events;
mod progress;
mod timers;

pub use events::ScanEvent;
pub use progress::{ProgressSimulator, PROGRESS_CEILING};

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use reqwest::Url;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::ScanError;
use crate::session::{PersistedScanRecord, ScanPhase, ScanSession};
use crate::store::ScanStateStore;
use crate::transport::{RemoteState, RemoteStatus, ScanTransport};

use timers::CycleTimers;

/// Timing and simulation parameters for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub progress_tick: Duration,
    pub poll_interval: Duration,
    /// Absolute ceiling on a scan's lifetime, measured from launch
    pub timeout: Duration,
    /// Delay between a Completed/Stopped cycle end and the return to Idle
    pub grace_delay: Duration,
    /// Persisted records older than this are discarded instead of resumed
    pub max_record_age: Duration,
    pub min_step: u8,
    pub max_step: u8,
    pub rng_seed: Option<u64>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            progress_tick: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30 * 60),
            grace_delay: Duration::from_secs(2),
            max_record_age: Duration::from_secs(6 * 60 * 60),
            min_step: 1,
            max_step: 3,
            rng_seed: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let scan = &config.scan;
        Self {
            progress_tick: Duration::from_millis(scan.progress_tick_ms),
            poll_interval: Duration::from_millis(scan.poll_interval_ms),
            timeout: Duration::from_secs(scan.timeout_secs),
            grace_delay: Duration::from_millis(scan.grace_ms),
            max_record_age: Duration::from_secs(scan.max_record_age_secs),
            min_step: scan.min_step,
            max_step: scan.max_step,
            rng_seed: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum TimerEvent {
    ProgressTick,
    PollResult(Result<RemoteStatus, ScanError>),
    Deadline,
    GraceElapsed,
}

/// A timer callback, tagged with the scan cycle that scheduled it
#[derive(Debug)]
pub(crate) struct TimerMessage {
    cycle: u64,
    event: TimerEvent,
}

impl TimerMessage {
    pub(crate) fn new(cycle: u64, event: TimerEvent) -> Self {
        Self { cycle, event }
    }
}

enum Command {
    Start {
        target_url: String,
        reply: oneshot::Sender<Result<String, ScanError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), ScanError>>,
    },
    Shutdown,
}

enum Event {
    Command(Command),
    Timer(TimerMessage),
}

/// Cloneable front door to a running [`ScanOrchestrator`]
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    broadcaster: broadcast::Sender<ScanEvent>,
    snapshot: watch::Receiver<ScanSession>,
}

impl OrchestratorHandle {
    /// Launch a scan of `target_url`. Returns the service-assigned scan id.
    pub async fn start_scan(&self, target_url: &str) -> Result<String, ScanError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                target_url: target_url.to_string(),
                reply,
            })
            .map_err(|_| ScanError::OrchestratorStopped)?;
        rx.await.map_err(|_| ScanError::OrchestratorStopped)?
    }

    /// Ask the service to stop the running scan. On failure the scan stays active.
    pub async fn stop_scan(&self) -> Result<(), ScanError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .map_err(|_| ScanError::OrchestratorStopped)?;
        rx.await.map_err(|_| ScanError::OrchestratorStopped)?
    }

    /// Stop the orchestrator. An in-flight scan stays persisted for recovery.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.broadcaster.subscribe()
    }

    pub fn snapshot(&self) -> ScanSession {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ScanSession> {
        self.snapshot.clone()
    }
}

/// Client-side state machine for one scan at a time.
///
/// The orchestrator runs as a single task. User commands and timer callbacks
/// both arrive as events and are applied one at a time by [`Self::dispatch`],
/// so no two transitions ever interleave. Timer callbacks carry the cycle
/// that scheduled them and are dropped once that cycle has ended.
pub struct ScanOrchestrator {
    settings: OrchestratorSettings,
    transport: Arc<dyn ScanTransport>,
    store: Box<dyn ScanStateStore>,
    clock: Arc<dyn Clock>,
    simulator: ProgressSimulator,
    session: ScanSession,
    // Wall-clock launch time; persisted and used for the deadline even when
    // the session's started_at is an estimate reconstructed on recovery
    launched_at: Option<DateTime<Utc>>,
    cycle: u64,
    timers: Option<CycleTimers>,
    grace_timer: Option<JoinHandle<()>>,
    consecutive_poll_failures: u32,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    timer_tx: mpsc::UnboundedSender<TimerMessage>,
    timer_rx: mpsc::UnboundedReceiver<TimerMessage>,
    broadcaster: broadcast::Sender<ScanEvent>,
    snapshot_tx: watch::Sender<ScanSession>,
}

impl ScanOrchestrator {
    /// Build the orchestrator and run recovery against `store`.
    ///
    /// A fresh persisted scan puts the orchestrator straight into `Running`;
    /// its timers start and `Started` is re-emitted once [`Self::run`] begins.
    pub fn new(
        settings: OrchestratorSettings,
        transport: Arc<dyn ScanTransport>,
        store: Box<dyn ScanStateStore>,
        clock: Arc<dyn Clock>,
    ) -> (Self, OrchestratorHandle) {
        let simulator = ProgressSimulator::new(
            settings.min_step,
            settings.max_step,
            settings.progress_tick,
            settings.rng_seed,
        );

        let mut session = ScanSession::idle();
        let mut launched_at = None;

        if let Some(record) = Self::load_recoverable(store.as_ref(), clock.as_ref(), &settings) {
            let progress = record.progress_percent.min(PROGRESS_CEILING);
            let estimated_elapsed = chrono::Duration::from_std(simulator.estimated_elapsed(progress))
                .unwrap_or_else(|_| chrono::Duration::zero());

            session = ScanSession::from_record(&record);
            session.progress_percent = progress;
            session.started_at = Some(clock.now() - estimated_elapsed);
            launched_at = Some(record.started_at);

            info!(
                "Recovered scan {} of {} at {}%",
                record.scan_id, record.target_url, progress
            );
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (broadcaster, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.clone());

        let handle = OrchestratorHandle {
            commands: commands_tx,
            broadcaster: broadcaster.clone(),
            snapshot: snapshot_rx,
        };

        let orchestrator = Self {
            settings,
            transport,
            store,
            clock,
            simulator,
            session,
            launched_at,
            cycle: 0,
            timers: None,
            grace_timer: None,
            consecutive_poll_failures: 0,
            commands_rx,
            timer_tx,
            timer_rx,
            broadcaster,
            snapshot_tx,
        };

        (orchestrator, handle)
    }

    /// Process events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        if self.session.phase == ScanPhase::Running {
            self.resume_recovered().await;
        }

        loop {
            let event = tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => break,
                },
                Some(message) = self.timer_rx.recv() => Event::Timer(message),
            };

            if self.dispatch(event).await.is_break() {
                break;
            }
        }

        self.cancel_timers();
        if let Some(grace) = self.grace_timer.take() {
            grace.abort();
        }
        if self.session.phase.is_active() {
            info!(
                "Scan {} left persisted for recovery",
                self.current_scan_id()
            );
        }
        info!("Scan orchestrator stopped (phase {})", self.session.phase);
    }

    /// The single transition entry point
    async fn dispatch(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Command(Command::Start { target_url, reply }) => {
                let result = self.start_scan(&target_url).await;
                let _ = reply.send(result);
            }
            Event::Command(Command::Stop { reply }) => {
                let result = self.stop_scan().await;
                let _ = reply.send(result);
            }
            Event::Command(Command::Shutdown) => return ControlFlow::Break(()),
            Event::Timer(message) => self.on_timer(message),
        }
        ControlFlow::Continue(())
    }

    fn on_timer(&mut self, message: TimerMessage) {
        if message.cycle != self.cycle {
            debug!(
                "Dropping {:?} from cycle {} (current cycle {})",
                message.event, message.cycle, self.cycle
            );
            return;
        }

        let running = self.session.phase == ScanPhase::Running;
        match message.event {
            TimerEvent::ProgressTick if running => self.on_progress_tick(),
            TimerEvent::PollResult(result) if running => self.on_poll_result(result),
            TimerEvent::Deadline if running => self.on_deadline(),
            TimerEvent::GraceElapsed if self.session.phase.is_terminal() => self.enter_idle(),
            event => debug!("Ignoring {:?} in phase {}", event, self.session.phase),
        }
    }

    async fn start_scan(&mut self, target_url: &str) -> Result<String, ScanError> {
        if self.session.phase != ScanPhase::Idle {
            return Err(ScanError::ScanInProgress {
                phase: self.session.phase,
            });
        }
        let target_url = validate_target_url(target_url)?;

        self.session.target_url = target_url.clone();
        self.set_phase(ScanPhase::Initializing);

        let scan_id = match self.transport.start(&target_url).await {
            Ok(scan_id) => scan_id,
            Err(e) => {
                error!("Failed to launch scan of {}: {}", target_url, e);
                self.enter_idle();
                return Err(e);
            }
        };

        let now = self.clock.now();
        self.cycle += 1;
        self.launched_at = Some(now);
        self.consecutive_poll_failures = 0;
        self.session.scan_id = Some(scan_id.clone());
        self.session.started_at = Some(now);
        self.session.progress_percent = 0;
        self.session.status_message = ProgressSimulator::status_message(0).to_string();
        self.set_phase(ScanPhase::Running);
        self.persist();
        self.start_timers(&scan_id, self.settings.timeout);

        info!("Scan {} of {} started", scan_id, target_url);
        self.emit(ScanEvent::Started {
            scan_id: scan_id.clone(),
        });

        Ok(scan_id)
    }

    async fn stop_scan(&mut self) -> Result<(), ScanError> {
        if self.session.phase != ScanPhase::Running {
            return Err(ScanError::NoActiveScan);
        }
        let scan_id = self.current_scan_id();

        self.set_phase(ScanPhase::Stopping);
        match self.transport.stop(&scan_id).await {
            Ok(()) => {
                self.teardown();
                self.set_phase(ScanPhase::Stopped);
                info!("Scan {} stopped by request", scan_id);
                self.emit(ScanEvent::Stopped { scan_id });
                self.schedule_grace();
                Ok(())
            }
            Err(e) => {
                warn!("Stop request for scan {} failed: {}", scan_id, e);
                self.set_phase(ScanPhase::Running);
                Err(e)
            }
        }
    }

    async fn resume_recovered(&mut self) {
        let scan_id = self.current_scan_id();
        let launched_at = self.launched_at.unwrap_or_else(|| self.clock.now());
        let elapsed = (self.clock.now() - launched_at).to_std().unwrap_or_default();
        let deadline = self.settings.timeout.saturating_sub(elapsed);

        self.cycle += 1;

        // Already past the deadline: check the status once before the guard fires
        if deadline.is_zero() {
            info!(
                "Recovered scan {} outlived its timeout, checking its status once",
                scan_id
            );
            match self.transport.status(&scan_id).await {
                Ok(status) if status.status.is_terminal() => {
                    self.emit(ScanEvent::Started { scan_id });
                    self.on_poll_result(Ok(status));
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("Status check for recovered scan {} failed: {}", scan_id, e),
            }
        }

        self.persist();
        self.start_timers(&scan_id, deadline);

        info!(
            "Resuming scan {} at {}% ({:?} until timeout)",
            scan_id, self.session.progress_percent, deadline
        );
        self.emit(ScanEvent::Started { scan_id });
    }

    fn on_progress_tick(&mut self) {
        let current = self.session.progress_percent;
        let next = self.simulator.advance(current);
        if next == current {
            return;
        }

        self.session.progress_percent = next;
        self.session.status_message = ProgressSimulator::status_message(next).to_string();
        trace!("Scan progress {}% -> {}%", current, next);
        self.persist();
        self.publish();
    }

    fn on_poll_result(&mut self, result: Result<RemoteStatus, ScanError>) {
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                // Retried on the next tick; the timeout guard bounds how long
                self.consecutive_poll_failures += 1;
                warn!(
                    "Status poll for scan {} failed ({} in a row): {}",
                    self.current_scan_id(),
                    self.consecutive_poll_failures,
                    e
                );
                return;
            }
        };

        self.consecutive_poll_failures = 0;
        match status.status {
            RemoteState::Completed => self.on_completed(),
            RemoteState::Failed => self.on_failed(
                status
                    .error
                    .unwrap_or_else(|| "Scan failed without an error message".to_string()),
            ),
            RemoteState::Stopped => self.on_remote_stopped(),
            RemoteState::Running | RemoteState::Unknown => {
                trace!("Scan {} still running", self.current_scan_id())
            }
        }
    }

    fn on_completed(&mut self) {
        let scan_id = self.current_scan_id();
        self.teardown();

        self.session.progress_percent = 100;
        self.session.status_message = ProgressSimulator::status_message(100).to_string();
        self.set_phase(ScanPhase::Completed);

        info!("Scan {} completed", scan_id);
        self.emit(ScanEvent::Completed { scan_id });
        self.schedule_grace();
    }

    fn on_failed(&mut self, error: String) {
        let scan_id = self.current_scan_id();
        self.teardown();
        self.set_phase(ScanPhase::Failed);

        error!("Scan {} failed: {}", scan_id, error);
        self.emit(ScanEvent::Failed { scan_id, error });
        self.enter_idle();
    }

    fn on_remote_stopped(&mut self) {
        let scan_id = self.current_scan_id();
        self.teardown();
        self.set_phase(ScanPhase::Stopped);

        info!("Scan {} reported stopped by the service", scan_id);
        self.emit(ScanEvent::Stopped { scan_id });
        self.schedule_grace();
    }

    fn on_deadline(&mut self) {
        let scan_id = self.current_scan_id();
        self.teardown();
        self.set_phase(ScanPhase::TimedOut);

        warn!(
            "Scan {} did not finish within {:?}, giving up",
            scan_id, self.settings.timeout
        );
        self.emit(ScanEvent::TimedOut { scan_id });
        self.enter_idle();
    }

    fn start_timers(&mut self, scan_id: &str, deadline: Duration) {
        self.cancel_timers();
        self.timers = Some(CycleTimers::start(
            self.cycle,
            scan_id.to_string(),
            &self.settings,
            deadline,
            Arc::clone(&self.transport),
            self.timer_tx.clone(),
        ));
    }

    fn cancel_timers(&mut self) {
        if let Some(mut timers) = self.timers.take() {
            timers.cancel();
        }
    }

    /// End of a scan cycle: stop all timers and empty the persisted slot
    fn teardown(&mut self) {
        self.cancel_timers();
        self.clear_record();
    }

    fn schedule_grace(&mut self) {
        self.grace_timer = Some(timers::spawn_grace_timer(
            self.cycle,
            self.settings.grace_delay,
            self.timer_tx.clone(),
        ));
    }

    fn enter_idle(&mut self) {
        self.grace_timer = None;
        self.launched_at = None;
        self.session = ScanSession::idle();
        self.emit(ScanEvent::PhaseChanged {
            phase: ScanPhase::Idle,
        });
        self.publish();
        debug!("Scan orchestrator idle");
    }

    fn set_phase(&mut self, phase: ScanPhase) {
        debug!("Scan phase {} -> {}", self.session.phase, phase);
        self.session.phase = phase;
        self.emit(ScanEvent::PhaseChanged { phase });
        self.publish();
    }

    fn current_scan_id(&self) -> String {
        self.session.scan_id.clone().unwrap_or_default()
    }

    fn record(&self) -> Option<PersistedScanRecord> {
        let mut record = self.session.to_record()?;
        if let Some(launched_at) = self.launched_at {
            record.started_at = launched_at;
        }
        Some(record)
    }

    fn persist(&self) {
        if let Some(record) = self.record() {
            if let Err(e) = self.store.save(&record) {
                error!("Failed to persist scan {}: {}", record.scan_id, e);
            }
        }
    }

    fn clear_record(&self) {
        if let Err(e) = self.store.clear() {
            error!("Failed to clear persisted scan state: {}", e);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.session.clone());
    }

    fn emit(&self, event: ScanEvent) {
        // Err only means nobody is subscribed
        let _ = self.broadcaster.send(event);
    }

    /// Load the persisted record if it describes a live scan. Anything else
    /// in the slot (stale, unreadable, not running) is discarded silently.
    fn load_recoverable(
        store: &dyn ScanStateStore,
        clock: &dyn Clock,
        settings: &OrchestratorSettings,
    ) -> Option<PersistedScanRecord> {
        let record = match store.load() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!("Discarding unreadable persisted scan state: {}", e);
                Self::discard(store);
                return None;
            }
        };

        if record.phase != ScanPhase::Running {
            info!(
                "Discarding persisted scan {} in phase {}",
                record.scan_id, record.phase
            );
            Self::discard(store);
            return None;
        }

        if record.is_stale(clock.now(), settings.max_record_age) {
            info!(
                "Discarding stale persisted scan {} started at {}",
                record.scan_id, record.started_at
            );
            Self::discard(store);
            return None;
        }

        Some(record)
    }

    fn discard(store: &dyn ScanStateStore) {
        if let Err(e) = store.clear() {
            error!("Failed to clear persisted scan state: {}", e);
        }
    }
}

/// Accept only absolute http(s) URLs with a host
fn validate_target_url(target_url: &str) -> Result<String, ScanError> {
    let trimmed = target_url.trim();
    let invalid = |reason: &str| ScanError::InvalidUrl {
        url: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https targets can be scanned"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(trimmed.to_string())
}
