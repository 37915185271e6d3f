//! Scheduler: one task drives every enabled game.
//!
//! Each tick walks the active round of every game one step forward. Open
//! rounds lock once `lock_at` has passed (or emit a countdown) and resolve
//! right away. Resolving rounds settle, except crash rounds whose flight has
//! not reached the crash point yet; those emit a flight tick instead. Finished
//! rounds are retired and replaced by a fresh one. Every step is idempotent, so a tick that fails
//! halfway is simply repeated on the next one.

use crate::engine::{RoundEngine, SettleStatus};
use crate::events::EventPayload;
use crate::games::types::GameKind;
use crate::round::RoundPhase;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one tick did, summed over all games
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub opened: usize,
    pub locked: usize,
    pub settled: usize,
    pub in_flight: usize,
    pub delayed: usize,
    pub failed: usize,
}

pub struct Scheduler {
    engine: Arc<RoundEngine>,
    tick_interval: Duration,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(engine: Arc<RoundEngine>, tick_interval: Duration) -> Self {
        Self {
            engine,
            tick_interval,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts the tick loop; it ends when `shutdown` flips to `true`
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = self.tick_interval.as_millis() as u64, "scheduler started");

            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.running.store(false, Ordering::SeqCst);
                        }
                    }
                    _ = tick.tick() => {
                        let report = self.tick().await;
                        if report != TickReport::default() {
                            debug!(?report, "scheduler tick");
                        }
                    }
                }
            }

            info!("scheduler stopped");
        })
    }

    /// Advances every enabled game by one step
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for kind in self.engine.settings().enabled_games() {
            self.advance(kind, &mut report).await;

            self.engine.retire_finished(kind);
            if self.engine.active_round(kind).is_none() {
                match self.engine.open_next_round(kind).await {
                    Ok(_) => report.opened += 1,
                    Err(e) => {
                        warn!(%kind, error = %e, "could not open next round");
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }

    async fn advance(&self, kind: GameKind, report: &mut TickReport) {
        let Some(view) = self.engine.active_round(kind) else {
            return;
        };
        let round_id = view.round_id;
        let now = self.engine.clock().now_millis();

        match view.phase {
            RoundPhase::Open if now < view.lock_at => {
                self.engine.events().publish(
                    kind,
                    round_id,
                    now,
                    EventPayload::Countdown {
                        remaining_ms: view.lock_at - now,
                    },
                );
                return;
            }
            RoundPhase::Open => match self.engine.request_lock(kind, round_id).await {
                Ok(_) => report.locked += 1,
                Err(e) => {
                    warn!(%kind, round_id, error = %e, "lock failed");
                    report.failed += 1;
                    return;
                }
            },
            RoundPhase::Locked | RoundPhase::Resolving => {}
            RoundPhase::Aborted if view.refund_pending => {}
            RoundPhase::Aborted | RoundPhase::Settled => return,
        }

        match self.engine.settle(kind, round_id).await {
            Ok(SettleStatus::Settled { .. }) | Ok(SettleStatus::Refunded { .. }) => {
                report.settled += 1
            }
            Ok(SettleStatus::InFlight { flight }) => {
                report.in_flight += 1;
                self.engine.events().publish(
                    kind,
                    round_id,
                    now,
                    EventPayload::FlightTick {
                        multiplier: flight.multiplier,
                        elapsed_ms: flight.elapsed_ms,
                    },
                );
            }
            Ok(SettleStatus::Delayed { .. }) => report.delayed += 1,
            Err(e) => {
                warn!(%kind, round_id, error = %e, "settlement failed");
                report.failed += 1;
            }
        }
    }
}
