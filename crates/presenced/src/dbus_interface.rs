use crate::api::{Api, ApiResponse};
use crate::source::ObservationPublisher;
use crate::tracker::TrackerStats;
use presence_core::{Detection, Frame, Observation, ZoneId};
use std::sync::Arc;
use tokio::runtime::Handle;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Presence1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

/// D-Bus interface for the presence daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
///
/// Request/response methods take a JSON body and return the JSON envelope
/// produced by [`ApiResponse::to_json`]; domain failures travel inside the
/// envelope, not as D-Bus errors.
pub struct PresenceService {
    api: Arc<Api>,
    publisher: ObservationPublisher,
    tracker: Option<Arc<TrackerStats>>,
    zone_id: ZoneId,
    runtime: Handle,
}

impl PresenceService {
    pub fn new(
        api: Arc<Api>,
        publisher: ObservationPublisher,
        tracker: Option<Arc<TrackerStats>>,
        zone_id: ZoneId,
        runtime: Handle,
    ) -> Self {
        Self {
            api,
            publisher,
            tracker,
            zone_id,
            runtime,
        }
    }

    /// Run a ledger-backed handler on the blocking pool.
    async fn call(
        &self,
        method: &'static str,
        op: fn(&Api, &str) -> ApiResponse,
        request: &str,
    ) -> String {
        let api = Arc::clone(&self.api);
        let request = request.to_owned();
        let response = match self.runtime.spawn_blocking(move || op(&api, &request)).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(method, error = %err, "handler task failed");
                ApiResponse::internal(format!("{method} failed: {err}"))
            }
        };
        if !response.is_success() {
            tracing::debug!(method, status = response.status, "request rejected");
        }
        response.to_json()
    }
}

/// Validate a pushed frame and its detector output.
pub fn decode_observation(
    frame: Vec<u8>,
    width: u32,
    height: u32,
    detections: &str,
) -> Result<Observation, String> {
    let frame = Frame::new(frame, width, height).map_err(|e| e.to_string())?;
    let detections: Vec<Detection> =
        serde_json::from_str(detections).map_err(|e| format!("invalid detections: {e}"))?;
    Ok(Observation { frame, detections })
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Add or rename a person: `{personKind, personId, name}`.
    async fn register_person(&self, request: &str) -> String {
        self.call("RegisterPerson", Api::register_person, request).await
    }

    /// Open a presence record: `{personKind, personId, zoneId, cameraId?, timestamp?}`.
    async fn record_entry(&self, request: &str) -> String {
        self.call("RecordEntry", Api::record_entry, request).await
    }

    /// Close the open record or write an exit-only one: `{personKind, personId, zoneId?, timestamp?}`.
    async fn record_exit(&self, request: &str) -> String {
        self.call("RecordExit", Api::record_exit, request).await
    }

    async fn get_record(&self, request: &str) -> String {
        self.call("GetRecord", Api::get_record, request).await
    }

    /// Operator override: `{recordId}`.
    async fn mark_exit(&self, request: &str) -> String {
        self.call("MarkExit", Api::mark_exit, request).await
    }

    /// Store an unknown face cropped elsewhere: `{frameCrop, zoneId?, confidence?, notes?}`.
    async fn report_unknown(&self, request: &str) -> String {
        self.call("ReportUnknown", Api::report_unknown, request).await
    }

    async fn list_unknown(&self, request: &str) -> String {
        self.call("ListUnknown", Api::list_unknown, request).await
    }

    async fn review_unknown(&self, request: &str) -> String {
        self.call("ReviewUnknown", Api::review_unknown, request).await
    }

    async fn delete_unknown(&self, request: &str) -> String {
        self.call("DeleteUnknown", Api::delete_unknown, request).await
    }

    async fn unknown_image(&self, request: &str) -> String {
        self.call("UnknownImage", Api::unknown_image, request).await
    }

    async fn active_persons(&self, request: &str) -> String {
        self.call("ActivePersons", Api::active_persons, request).await
    }

    async fn zone_log(&self, request: &str) -> String {
        self.call("ZoneLog", Api::zone_log, request).await
    }

    async fn query_records(&self, request: &str) -> String {
        self.call("QueryRecords", Api::query_records, request).await
    }

    async fn analytics(&self, request: &str) -> String {
        self.call("Analytics", Api::analytics, request).await
    }

    /// Hand the newest frame and its matches to the tracking loop.
    ///
    /// `detections` is a JSON array of `{bbox: {x, y, width, height, confidence},
    /// person: {kind, id} | null}`. Returns the number of detections accepted.
    async fn publish_observation(
        &self,
        frame: Vec<u8>,
        width: u32,
        height: u32,
        detections: &str,
    ) -> zbus::fdo::Result<u32> {
        let observation = decode_observation(frame, width, height, detections)
            .map_err(zbus::fdo::Error::InvalidArgs)?;
        let count = observation.detections.len() as u32;
        tracing::trace!(count, "observation published");
        self.publisher.publish(observation);
        Ok(count)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let api = Arc::clone(&self.api);
        let unknown_stored = self
            .runtime
            .spawn_blocking(move || api.ledger().unknown_count())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "zoneId": self.zone_id,
            "unknownStored": unknown_stored,
            "tracking": self.tracker.is_some(),
            "tracker": self.tracker.as_ref().map(|stats| stats.snapshot()),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_observation() {
        let detections = r#"[
            {"bbox": {"x": 1, "y": 1, "width": 2, "height": 2, "confidence": 0.9},
             "person": {"kind": "STUDENT", "id": 7}},
            {"bbox": {"x": 0, "y": 0, "width": 3, "height": 3}}
        ]"#;
        let obs = decode_observation(vec![0; 16], 4, 4, detections).unwrap();
        assert_eq!(obs.detections.len(), 2);
        assert_eq!(obs.detections[0].person.map(|p| p.id), Some(7));
        assert!(obs.detections[1].person.is_none());
        assert_eq!(obs.detections[1].bbox.confidence, 0.0);
    }

    #[test]
    fn test_decode_observation_rejects_bad_input() {
        assert!(decode_observation(vec![0; 15], 4, 4, "[]").is_err());
        assert!(decode_observation(vec![0; 16], 4, 4, "{").is_err());
        let bad_kind = r#"[{"bbox": {"x": 0, "y": 0, "width": 1, "height": 1},
                           "person": {"kind": "VISITOR", "id": 1}}]"#;
        assert!(decode_observation(vec![0; 16], 4, 4, bad_kind).is_err());
    }
}
