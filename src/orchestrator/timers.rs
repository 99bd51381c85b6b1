use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{OrchestratorSettings, TimerEvent, TimerMessage};
use crate::transport::ScanTransport;

/// The three tasks that run while a scan is `Running`: progress tick, status
/// poll and timeout deadline. They share one cancellation token and never
/// touch session state; they only post [`TimerMessage`]s tagged with their cycle.
pub(super) struct CycleTimers {
    cycle: u64,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl CycleTimers {
    pub(super) fn start(
        cycle: u64,
        scan_id: String,
        settings: &OrchestratorSettings,
        deadline: Duration,
        transport: Arc<dyn ScanTransport>,
        tx: mpsc::UnboundedSender<TimerMessage>,
    ) -> Self {
        let token = CancellationToken::new();
        let handles = vec![
            spawn_progress_ticker(cycle, settings.progress_tick, token.clone(), tx.clone()),
            spawn_status_poller(
                cycle,
                scan_id,
                settings.poll_interval,
                transport,
                token.clone(),
                tx.clone(),
            ),
            spawn_timeout_guard(cycle, deadline, token.clone(), tx),
        ];

        log::debug!("Cycle {} timers started (deadline in {:?})", cycle, deadline);

        Self {
            cycle,
            token,
            handles,
        }
    }

    /// Cancel all three tasks. Calling this more than once is a no-op.
    pub(super) fn cancel(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        log::debug!("Cycle {} timers cancelled", self.cycle);
    }
}

impl Drop for CycleTimers {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn spawn_progress_ticker(
    cycle: u64,
    period: Duration,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<TimerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(TimerMessage::new(cycle, TimerEvent::ProgressTick)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_status_poller(
    cycle: u64,
    scan_id: String,
    period: Duration,
    transport: Arc<dyn ScanTransport>,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<TimerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            // One status call in flight at a time; the next tick waits for this one
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = transport.status(&scan_id) => result,
            };

            if tx
                .send(TimerMessage::new(cycle, TimerEvent::PollResult(result)))
                .is_err()
            {
                break;
            }
        }
    })
}

fn spawn_timeout_guard(
    cycle: u64,
    deadline: Duration,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<TimerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = time::sleep(deadline) => {
                let _ = tx.send(TimerMessage::new(cycle, TimerEvent::Deadline));
            }
        }
    })
}

/// One-shot delay after which a finished cycle returns to `Idle`
pub(super) fn spawn_grace_timer(
    cycle: u64,
    delay: Duration,
    tx: mpsc::UnboundedSender<TimerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(delay).await;
        let _ = tx.send(TimerMessage::new(cycle, TimerEvent::GraceElapsed));
    })
}
