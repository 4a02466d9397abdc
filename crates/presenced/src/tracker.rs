//! Live tracking loop.
//!
//! The tracker owns its dedup cache, cooldown gate, face source and ledger
//! connection on a dedicated OS thread, so tick processing never needs a
//! lock. A tokio interval drives it: each tick must take the single permit
//! of a semaphore before it is sent to the thread, and the permit is only
//! released once the tick has been processed. A tick that finds the permit
//! taken is dropped, never queued.

use crate::store::{Ledger, LedgerError};
use chrono::Utc;
use presence_core::{
    CameraId, Detection, Frame, NewUnknownDetection, Observation, PersonRef,
    RecognitionCache, UnknownCooldown, ZoneId,
};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("face source unavailable: {0}")]
    Source(String),
    #[error("failed to spawn tracker thread: {0}")]
    Spawn(std::io::Error),
    #[error("tracker thread exited")]
    ChannelClosed,
}

/// The external detector/matcher as seen by the tracker.
///
/// Returns the observation to process for this tick, or `None` when nothing
/// new has been seen since the last call.
pub trait FaceSource: Send {
    fn next_observation(&mut self) -> Result<Option<Observation>, TrackerError>;
}

/// Static per-session settings.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub zone_id: ZoneId,
    pub camera_id: Option<CameraId>,
    pub crop_padding: u32,
    pub dedup_ttl: Duration,
    pub unknown_cooldown: Duration,
}

/// Lifetime counters, shared with the D-Bus status call.
#[derive(Debug, Default)]
pub struct TrackerStats {
    ticks_processed: AtomicU64,
    ticks_skipped: AtomicU64,
    entries_recorded: AtomicU64,
    recognitions_suppressed: AtomicU64,
    unknown_admitted: AtomicU64,
    unknown_dropped: AtomicU64,
    last_tick_known: AtomicU64,
    last_tick_unknown: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub ticks_processed: u64,
    pub ticks_skipped: u64,
    pub entries_recorded: u64,
    pub recognitions_suppressed: u64,
    pub unknown_admitted: u64,
    pub unknown_dropped: u64,
    /// Faces in the newest observation matched to a person.
    pub last_tick_known: u64,
    /// Faces in the newest observation with no match.
    pub last_tick_unknown: u64,
}

impl TrackerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            entries_recorded: self.entries_recorded.load(Ordering::Relaxed),
            recognitions_suppressed: self.recognitions_suppressed.load(Ordering::Relaxed),
            unknown_admitted: self.unknown_admitted.load(Ordering::Relaxed),
            unknown_dropped: self.unknown_dropped.load(Ordering::Relaxed),
            last_tick_known: self.last_tick_known.load(Ordering::Relaxed),
            last_tick_unknown: self.last_tick_unknown.load(Ordering::Relaxed),
        }
    }

    fn add(&self, outcome: &TickOutcome) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        self.entries_recorded
            .fetch_add(outcome.entries_recorded, Ordering::Relaxed);
        self.recognitions_suppressed
            .fetch_add(outcome.recognitions_suppressed, Ordering::Relaxed);
        self.unknown_admitted
            .fetch_add(outcome.unknown_admitted, Ordering::Relaxed);
        self.unknown_dropped
            .fetch_add(outcome.unknown_dropped, Ordering::Relaxed);
    }

    /// Ticks without a fresh observation keep the previous counts.
    fn observed(&self, outcome: &TickOutcome) {
        self.last_tick_known.store(outcome.known_seen, Ordering::Relaxed);
        self.last_tick_unknown.store(outcome.unknown_seen, Ordering::Relaxed);
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Recognitions forwarded to the transition engine.
    pub entry_attempts: u64,
    pub entries_recorded: u64,
    /// Forwarded recognitions that hit an existing open record.
    pub already_inside: u64,
    pub recognitions_suppressed: u64,
    pub unknown_admitted: u64,
    pub unknown_dropped: u64,
    /// Detections in the observation that carried a person.
    pub known_seen: u64,
    pub unknown_seen: u64,
}

/// Per-session tracking state. Lives on the tracker thread.
pub struct Tracker<S> {
    ledger: Ledger,
    source: S,
    settings: TrackerSettings,
    recognized: RecognitionCache,
    cooldown: UnknownCooldown,
    stats: Arc<TrackerStats>,
}

impl<S: FaceSource> Tracker<S> {
    pub fn new(ledger: Ledger, source: S, settings: TrackerSettings) -> Self {
        Self {
            recognized: RecognitionCache::new(settings.dedup_ttl),
            cooldown: UnknownCooldown::new(settings.unknown_cooldown),
            ledger,
            source,
            settings,
            stats: Arc::new(TrackerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TrackerStats> {
        Arc::clone(&self.stats)
    }

    /// Pull the latest observation and process it. Source failures are logged.
    pub fn run_tick(&mut self, now: Instant) -> TickOutcome {
        match self.source.next_observation() {
            Ok(Some(observation)) => self.process_observation(now, &observation),
            Ok(None) => {
                self.stats.add(&TickOutcome::default());
                TickOutcome::default()
            }
            Err(err) => {
                tracing::warn!(error = %err, "face source failed; skipping tick");
                self.stats.add(&TickOutcome::default());
                TickOutcome::default()
            }
        }
    }

    /// Route every detection through the dedup cache or the unknown gate.
    pub fn process_observation(&mut self, now: Instant, observation: &Observation) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for detection in &observation.detections {
            match detection.person {
                Some(person) => {
                    outcome.known_seen += 1;
                    self.handle_recognized(now, person, &mut outcome);
                }
                None => {
                    outcome.unknown_seen += 1;
                    self.handle_unknown(now, &observation.frame, detection, &mut outcome);
                }
            }
        }

        let purged = self.recognized.purge_expired(now);
        if purged > 0 {
            tracing::debug!(purged, "dedup entries expired");
        }

        self.stats.add(&outcome);
        self.stats.observed(&outcome);
        outcome
    }

    fn handle_recognized(&mut self, now: Instant, person: PersonRef, outcome: &mut TickOutcome) {
        if !self.recognized.admit(person, now) {
            outcome.recognitions_suppressed += 1;
            return;
        }

        outcome.entry_attempts += 1;
        let result = self.ledger.record_entry(
            person,
            self.settings.zone_id,
            self.settings.camera_id,
            None,
        );

        match result {
            Ok(_) => outcome.entries_recorded += 1,
            Err(LedgerError::Conflict { existing }) => {
                tracing::debug!(person = %person, record = existing.id, zone = ?existing.zone_id, "already inside");
                outcome.already_inside += 1;
            }
            Err(LedgerError::NotFound(missing)) => {
                tracing::warn!(person = %person, %missing, "recognized person is not in the registry");
            }
            Err(err) => {
                // Transient: let the next sighting try again.
                tracing::warn!(person = %person, error = %err, "entry not recorded");
                self.recognized.forget(&person);
            }
        }
    }

    fn handle_unknown(
        &mut self,
        now: Instant,
        frame: &Frame,
        detection: &Detection,
        outcome: &mut TickOutcome,
    ) {
        if !self.cooldown.would_admit(now) {
            outcome.unknown_dropped += 1;
            return;
        }

        let image = match frame.capture_face(&detection.bbox, self.settings.crop_padding) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(error = %err, bbox = ?detection.bbox, "could not crop unknown face");
                outcome.unknown_dropped += 1;
                return;
            }
        };

        let capture = NewUnknownDetection {
            zone_id: self.settings.zone_id,
            captured_image: image,
            confidence: detection.bbox.confidence.clamp(0.0, 1.0),
            notes: None,
        };
        match self.ledger.insert_unknown(capture, Utc::now()) {
            Ok(stored) => {
                self.cooldown.record_admission(now);
                outcome.unknown_admitted += 1;
                tracing::debug!(id = stored.id, "unknown face admitted");
            }
            Err(err) => {
                tracing::warn!(error = %err, "unknown face capture not stored");
                outcome.unknown_dropped += 1;
            }
        }
    }
}

/// Messages sent from the ticker to the tracker thread.
enum TrackerRequest {
    Tick {
        at: Instant,
        /// Held until the tick is fully processed.
        permit: OwnedSemaphorePermit,
    },
}

/// Clone-safe handle to the tracker thread.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerRequest>,
    gate: Arc<Semaphore>,
    stats: Arc<TrackerStats>,
}

impl TrackerHandle {
    pub fn stats(&self) -> Arc<TrackerStats> {
        Arc::clone(&self.stats)
    }

    /// Hand a tick to the tracker unless the previous one is still running.
    ///
    /// Returns `Ok(false)` when the tick was dropped.
    pub fn try_tick(&self, at: Instant) -> Result<bool, TrackerError> {
        let permit = match Arc::clone(&self.gate).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("previous tick still processing; dropping tick");
                return Ok(false);
            }
            Err(TryAcquireError::Closed) => return Err(TrackerError::ChannelClosed),
        };

        match self.tx.try_send(TrackerRequest::Tick { at, permit }) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(TrackerError::ChannelClosed),
        }
    }

    /// Fire [`try_tick`](Self::try_tick) every `period` until `shutdown` resolves.
    pub async fn run(self, period: Duration, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(period_ms = period.as_millis() as u64, "tracking loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                instant = interval.tick() => {
                    if let Err(err) = self.try_tick(instant.into_std()) {
                        tracing::error!(error = %err, "tracker unavailable; stopping tracking loop");
                        break;
                    }
                }
            }
        }
        tracing::info!("tracking loop stopped");
    }
}

/// Spawn the tracker on a dedicated OS thread.
pub fn spawn_tracker<S: FaceSource + 'static>(
    tracker: Tracker<S>,
) -> Result<TrackerHandle, TrackerError> {
    let session = Uuid::new_v4();
    let zone = tracker.settings.zone_id;
    let stats = tracker.stats();
    let (tx, mut rx) = mpsc::channel::<TrackerRequest>(1);

    let mut tracker = tracker;
    std::thread::Builder::new()
        .name("presence-tracker".into())
        .spawn(move || {
            let span = tracing::info_span!("tracker", %session, zone);
            let _guard = span.enter();
            tracing::info!("tracker thread started");

            while let Some(req) = rx.blocking_recv() {
                match req {
                    TrackerRequest::Tick { at, permit } => {
                        let outcome = tracker.run_tick(at);
                        if outcome != TickOutcome::default() {
                            tracing::debug!(?outcome, "tick processed");
                        }
                        drop(permit);
                    }
                }
            }
            tracing::info!("tracker thread exiting");
        })
        .map_err(TrackerError::Spawn)?;

    Ok(TrackerHandle {
        tx,
        gate: Arc::new(Semaphore::new(1)),
        stats,
    })
}
