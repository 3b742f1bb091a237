//! Periodic arrival watcher: reads the latest snapshot and sends one
//! notification per arrival window once it is inside the threshold.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use flightwatch_adapters::NotificationSink;
use flightwatch_core::{arrival_instant, whole_minutes_ceil, Flight, FlightKey, Snapshot};
use flightwatch_storage::{SnapshotRead, SnapshotStore};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherPhase {
    Idle,
    Evaluating,
    Notified,
}

/// A flight identity plus the concrete landing instant it was alerted for.
/// The same flight on the next day is a different window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifiedWindow {
    pub key: FlightKey,
    pub arrival_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherState {
    pub last_snapshot_at: Option<NaiveDateTime>,
    pub last_notified: Option<NotifiedWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No snapshot yet, or it could not be read.
    NoData,
    NoUpcomingArrival,
    /// Next arrival is outside `(0, threshold]` minutes.
    OutsideWindow { flight_number: String, minutes: i64 },
    AlreadyNotified { flight_number: String },
    Notified { flight_number: String, minutes: i64 },
    /// Delivery failed; the window stays open and is retried next tick.
    SendFailed { flight_number: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub threshold_minutes: i64,
    pub recipient: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 5,
            recipient: String::new(),
        }
    }
}

pub fn format_arrival_message(flight: &Flight, minutes: i64) -> String {
    let mut message = format!(
        "Flight {} from {} arrives at {} in {} minutes ({}).",
        flight.flight_number,
        flight.origin_city,
        flight.destination_actual_time,
        minutes,
        flight.status_text
    );
    if let Some(fin) = &flight.tail_number {
        message.push_str(&format!(" FIN {fin}."));
    }
    if let Some(url) = &flight.tracking_url {
        message.push_str(&format!("\nTrack it: {url}"));
    }
    message
}

pub struct ArrivalWatcher {
    store: SnapshotStore,
    sink: Arc<dyn NotificationSink>,
    config: WatcherConfig,
    state: WatcherState,
    phase: WatcherPhase,
}

impl ArrivalWatcher {
    pub fn new(store: SnapshotStore, sink: Arc<dyn NotificationSink>, config: WatcherConfig) -> Self {
        Self {
            store,
            sink,
            config,
            state: WatcherState::default(),
            phase: WatcherPhase::Idle,
        }
    }

    pub fn phase(&self) -> WatcherPhase {
        self.phase
    }

    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.tick_at(Local::now().naive_local()).await
    }

    pub async fn tick_at(&mut self, now: NaiveDateTime) -> TickOutcome {
        self.phase = WatcherPhase::Evaluating;
        let snapshot = match self.store.load().await {
            SnapshotRead::Loaded(snapshot) => snapshot,
            SnapshotRead::Missing => {
                debug!(path = %self.store.path().display(), "no snapshot yet");
                return self.finish(TickOutcome::NoData);
            }
            SnapshotRead::Unreadable(reason) => {
                warn!(%reason, "snapshot unreadable; skipping tick");
                return self.finish(TickOutcome::NoData);
            }
        };
        self.state.last_snapshot_at = Some(snapshot.generated_at);
        let outcome = self.evaluate(now, &snapshot).await;
        self.finish(outcome)
    }

    async fn evaluate(&mut self, now: NaiveDateTime, snapshot: &Snapshot) -> TickOutcome {
        let Some(flight) = snapshot.next_arrival_flight.as_ref() else {
            return TickOutcome::NoUpcomingArrival;
        };
        let Some(clock) = flight.arrival_clock() else {
            warn!(flight = %flight.flight_number, time = %flight.destination_actual_time, "next arrival has no usable time");
            return TickOutcome::NoUpcomingArrival;
        };

        // The arrival belongs to the snapshot's day frame; once it has passed,
        // an old snapshot has nothing left to report.
        let arrival_at = arrival_instant(snapshot.generated_at, clock);
        if arrival_at < now {
            debug!(
                flight = %flight.flight_number,
                snapshot_at = %snapshot.generated_at,
                "next arrival already passed; snapshot is stale"
            );
            return TickOutcome::NoUpcomingArrival;
        }
        let minutes = whole_minutes_ceil(arrival_at - now);

        if minutes <= 0 || minutes > self.config.threshold_minutes {
            return TickOutcome::OutsideWindow {
                flight_number: flight.flight_number.clone(),
                minutes,
            };
        }

        let window = NotifiedWindow {
            key: flight.key(),
            arrival_at,
        };
        if self.state.last_notified.as_ref() == Some(&window) {
            return TickOutcome::AlreadyNotified {
                flight_number: flight.flight_number.clone(),
            };
        }

        let message = format_arrival_message(flight, minutes);
        match self.sink.send(&self.config.recipient, &message).await {
            Ok(()) => {
                info!(flight = %flight.flight_number, minutes, "arrival notification sent");
                self.state.last_notified = Some(window);
                TickOutcome::Notified {
                    flight_number: flight.flight_number.clone(),
                    minutes,
                }
            }
            Err(err) => {
                warn!(flight = %flight.flight_number, error = %err, "arrival notification failed; will retry");
                TickOutcome::SendFailed {
                    flight_number: flight.flight_number.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }

    fn finish(&mut self, outcome: TickOutcome) -> TickOutcome {
        self.phase = match outcome {
            TickOutcome::Notified { .. } => WatcherPhase::Notified,
            _ => WatcherPhase::Idle,
        };
        outcome
    }
}
