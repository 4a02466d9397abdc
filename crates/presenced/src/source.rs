//! Latest-observation handoff between the external detector and the tracker.
//!
//! The detector pushes over D-Bus whenever it has something; the tracker
//! samples on its own clock. Only the newest observation is kept, and each
//! one is handed to the tracker at most once.

use crate::tracker::{FaceSource, TrackerError};
use presence_core::Observation;
use tokio::sync::watch;

/// Producer half, held by the D-Bus service.
pub struct ObservationPublisher {
    tx: watch::Sender<Option<Observation>>,
}

impl ObservationPublisher {
    /// Replace whatever observation is waiting. Works with no tracker attached.
    pub fn publish(&self, observation: Observation) {
        self.tx.send_replace(Some(observation));
    }
}

/// Consumer half, owned by the tracker thread.
pub struct LatestObservation {
    rx: watch::Receiver<Option<Observation>>,
}

impl FaceSource for LatestObservation {
    fn next_observation(&mut self) -> Result<Option<Observation>, TrackerError> {
        match self.rx.has_changed() {
            Ok(true) => Ok(self.rx.borrow_and_update().clone()),
            Ok(false) => Ok(None),
            Err(_) => Err(TrackerError::Source("observation publisher dropped".into())),
        }
    }
}

pub fn observation_channel() -> (ObservationPublisher, LatestObservation) {
    let (tx, rx) = watch::channel(None);
    (ObservationPublisher { tx }, LatestObservation { rx })
}
