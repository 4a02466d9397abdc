//! Request handlers behind the D-Bus service.
//!
//! Every operation takes a JSON request body and produces an [`ApiResponse`]
//! carrying an HTTP-style status code, serialized as
//! `{"status": 201, "data": ...}` or `{"status": 409, "error": {...}}`.

use crate::store::{Ledger, LedgerError, Missing, Page, RecordFilter};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use presence_core::{
    CameraId, NewUnknownDetection, PersonKind, PersonRef, PresenceRecord, RecordId,
    UnknownCooldown, UnknownDetection, UnknownId, UnknownStatus, ZoneId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const INTERNAL_ENVELOPE: &str =
    r#"{"status":500,"error":{"kind":"internal","message":"response could not be encoded"}}"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<PresenceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    fn with_data(status: u16, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                status,
                data: Some(data),
                error: None,
            },
            Err(err) => Self::internal(err.to_string()),
        }
    }

    fn ok(data: impl Serialize) -> Self {
        Self::with_data(200, data)
    }

    fn created(data: impl Serialize) -> Self {
        Self::with_data(201, data)
    }

    fn failure(status: u16, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            error: Some(ApiError {
                kind,
                message: message.into(),
                field: None,
                existing: None,
            }),
        }
    }

    fn invalid(status: u16, field: &'static str, message: impl Into<String>) -> Self {
        let mut response = Self::failure(status, "validation", message);
        if let Some(error) = response.error.as_mut() {
            error.field = Some(field);
        }
        response
    }

    pub fn internal(message: String) -> Self {
        Self::failure(500, "internal", message)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The envelope sent back over the bus.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| INTERNAL_ENVELOPE.to_string())
    }
}

impl From<LedgerError> for ApiResponse {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation { field, message } => Self::invalid(422, field, message),
            LedgerError::NotFound(missing) => {
                Self::failure(404, "not_found", format!("{missing} not found"))
            }
            LedgerError::Conflict { existing } => {
                let message = format!(
                    "{} already has an active entry (record {})",
                    existing.person, existing.id
                );
                let mut response = Self::failure(409, "conflict", message);
                if let Some(error) = response.error.as_mut() {
                    error.existing = Some(*existing);
                }
                response
            }
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

type Handled = Result<ApiResponse, ApiResponse>;

fn handle(f: impl FnOnce() -> Handled) -> ApiResponse {
    match f() {
        Ok(response) | Err(response) => response,
    }
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ApiResponse> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body)
        .map_err(|err| ApiResponse::failure(422, "validation", format!("malformed request: {err}")))
}

fn person(kind: &str, id: i64) -> Result<PersonRef, ApiResponse> {
    let kind: PersonKind = kind
        .parse()
        .map_err(|err: presence_core::types::UnknownPersonKind| {
            ApiResponse::invalid(422, "personKind", err.to_string())
        })?;
    Ok(PersonRef::new(kind, id))
}

/// Accepts raw base64 or a `data:<mime>;base64,<payload>` URL.
fn decode_image(input: &str) -> Result<Vec<u8>, ApiResponse> {
    let payload = match input.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| ApiResponse::invalid(422, "frameCrop", "data URL has no payload"))?,
        None => input,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|err| ApiResponse::invalid(422, "frameCrop", format!("invalid base64: {err}")))?;
    if bytes.is_empty() {
        return Err(ApiResponse::invalid(422, "frameCrop", "image is required"));
    }
    Ok(bytes)
}

fn data_url(image: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(image))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    person_kind: String,
    person_id: i64,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRequest {
    person_kind: String,
    person_id: i64,
    zone_id: ZoneId,
    camera_id: Option<CameraId>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExitRequest {
    person_kind: String,
    person_id: i64,
    zone_id: Option<ZoneId>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportUnknownRequest {
    frame_crop: String,
    zone_id: Option<ZoneId>,
    confidence: Option<f32>,
    notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListUnknownRequest {
    status: Option<String>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewRequest {
    id: UnknownId,
    status: String,
    notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdRequest {
    id: UnknownId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordIdRequest {
    record_id: RecordId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveRequest {
    zone_id: Option<ZoneId>,
    person_kind: Option<String>,
    person_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneLogRequest {
    zone_id: ZoneId,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    zone_id: Option<ZoneId>,
    person_kind: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnknownView {
    id: UnknownId,
    zone_id: ZoneId,
    captured_image: String,
    confidence: f32,
    detected_time: DateTime<Utc>,
    status: UnknownStatus,
    notes: String,
}

impl From<UnknownDetection> for UnknownView {
    fn from(d: UnknownDetection) -> Self {
        Self {
            captured_image: data_url(&d.captured_image),
            id: d.id,
            zone_id: d.zone_id,
            confidence: d.confidence,
            detected_time: d.detected_time,
            status: d.status,
            notes: d.notes,
        }
    }
}

/// An open record with the person's registry name.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveEntry {
    #[serde(flatten)]
    record: PresenceRecord,
    name: Option<String>,
}

/// A zone log row with its stay length.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    #[serde(flatten)]
    record: PresenceRecord,
    duration_minutes: Option<i64>,
    ongoing: bool,
}

impl From<PresenceRecord> for LogEntry {
    fn from(record: PresenceRecord) -> Self {
        Self {
            duration_minutes: record.duration_minutes(),
            ongoing: record.is_open() && !record.is_exit_only(),
            record,
        }
    }
}

/// Shared handler state. Cheap to call from any thread.
pub struct Api {
    ledger: Arc<Ledger>,
    /// Gate for externally reported unknown faces, separate from the tracker's.
    unknown_gate: Mutex<UnknownCooldown>,
    default_zone: ZoneId,
}

impl Api {
    pub fn new(ledger: Arc<Ledger>, default_zone: ZoneId, unknown_cooldown: Duration) -> Self {
        Self {
            ledger,
            unknown_gate: Mutex::new(UnknownCooldown::new(unknown_cooldown)),
            default_zone,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Add or rename a person in the local registry.
    pub fn register_person(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: RegisterRequest = parse(body)?;
            let person = person(&req.person_kind, req.person_id)?;
            self.ledger.register_person(person, &req.name)?;
            Ok(ApiResponse::ok(json!({ "person": person, "name": req.name })))
        })
    }

    pub fn record_entry(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: EntryRequest = parse(body)?;
            let person = person(&req.person_kind, req.person_id)?;
            let record = self
                .ledger
                .record_entry(person, req.zone_id, req.camera_id, req.timestamp)?;
            Ok(ApiResponse::created(record))
        })
    }

    pub fn record_exit(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: ExitRequest = parse(body)?;
            let person = person(&req.person_kind, req.person_id)?;
            let record = self.ledger.record_exit(person, req.zone_id, req.timestamp)?;
            Ok(ApiResponse::ok(record))
        })
    }

    pub fn get_record(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: RecordIdRequest = parse(body)?;
            match self.ledger.get_record(req.record_id)? {
                Some(record) => Ok(ApiResponse::ok(LogEntry::from(record))),
                None => Err(LedgerError::NotFound(Missing::Record(req.record_id)).into()),
            }
        })
    }

    pub fn mark_exit(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: RecordIdRequest = parse(body)?;
            Ok(ApiResponse::ok(self.ledger.mark_exit(req.record_id)?))
        })
    }

    pub fn report_unknown(&self, body: &str) -> ApiResponse {
        self.report_unknown_at(body, Instant::now())
    }

    fn report_unknown_at(&self, body: &str, now: Instant) -> ApiResponse {
        handle(|| {
            let req: ReportUnknownRequest = parse(body)?;
            let image = decode_image(&req.frame_crop)?;

            let mut gate = self
                .unknown_gate
                .lock()
                .map_err(|_| ApiResponse::internal("unknown gate lock poisoned".into()))?;
            if !gate.would_admit(now) {
                tracing::debug!("reported unknown face inside cooldown; dropped");
                return Ok(ApiResponse::ok(json!({ "admitted": false })));
            }

            let stored = self.ledger.insert_unknown(
                NewUnknownDetection {
                    zone_id: req.zone_id.unwrap_or(self.default_zone),
                    captured_image: image,
                    confidence: req.confidence.unwrap_or(0.0),
                    notes: req.notes,
                },
                Utc::now(),
            )?;
            gate.record_admission(now);

            Ok(ApiResponse::created(json!({
                "admitted": true,
                "id": stored.id,
                "detectedTime": stored.detected_time,
                "status": stored.status,
            })))
        })
    }

    pub fn list_unknown(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: ListUnknownRequest = parse(body)?;
            let status = req
                .status
                .as_deref()
                .map(str::parse::<UnknownStatus>)
                .transpose()
                .map_err(|err| ApiResponse::invalid(422, "status", err.to_string()))?;
            let items: Vec<UnknownView> = self
                .ledger
                .list_unknown(status, req.limit)?
                .into_iter()
                .map(UnknownView::from)
                .collect();
            Ok(ApiResponse::ok(items))
        })
    }

    pub fn review_unknown(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: ReviewRequest = parse(body)?;
            let status: UnknownStatus = req
                .status
                .parse()
                .map_err(|err: presence_core::types::InvalidUnknownStatus| {
                    ApiResponse::invalid(400, "status", err.to_string())
                })?;
            let updated = self
                .ledger
                .update_unknown_status(req.id, status, req.notes.as_deref())?;
            Ok(ApiResponse::ok(json!({
                "id": updated.id,
                "status": updated.status,
                "notes": updated.notes,
            })))
        })
    }

    pub fn delete_unknown(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: IdRequest = parse(body)?;
            self.ledger.delete_unknown(req.id)?;
            Ok(ApiResponse::ok(json!({ "id": req.id, "deleted": true })))
        })
    }

    pub fn unknown_image(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: IdRequest = parse(body)?;
            let image = self.ledger.unknown_image(req.id)?;
            Ok(ApiResponse::ok(json!({
                "id": req.id,
                "contentType": "image/jpeg",
                "image": STANDARD.encode(image),
            })))
        })
    }

    pub fn active_persons(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: ActiveRequest = parse(body)?;
            let records = match (req.person_kind, req.person_id, req.zone_id) {
                (Some(kind), Some(id), _) => {
                    let person = person(&kind, id)?;
                    let open = self.ledger.open_record_for(person)?;
                    open.into_iter()
                        .filter(|r| req.zone_id.is_none() || r.zone_id == req.zone_id)
                        .collect()
                }
                (None, None, Some(zone)) => self.ledger.active_in_zone(zone)?,
                (None, None, None) => self.ledger.active_persons()?,
                _ => {
                    return Err(ApiResponse::invalid(
                        422,
                        "personId",
                        "personKind and personId go together",
                    ))
                }
            };

            let mut entries = Vec::with_capacity(records.len());
            for record in records {
                let name = self.ledger.person_name(record.person)?;
                entries.push(ActiveEntry { record, name });
            }
            Ok(ApiResponse::ok(json!({
                "count": entries.len(),
                "records": entries,
            })))
        })
    }

    pub fn zone_log(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: ZoneLogRequest = parse(body)?;
            let page = self.ledger.zone_log(req.zone_id, req.limit, req.offset)?;
            Ok(ApiResponse::ok(Page {
                items: page.items.into_iter().map(LogEntry::from).collect(),
                total: page.total,
                limit: page.limit,
                offset: page.offset,
            }))
        })
    }

    pub fn query_records(&self, body: &str) -> ApiResponse {
        handle(|| {
            let req: QueryRequest = parse(body)?;
            let person_kind = req
                .person_kind
                .as_deref()
                .map(str::parse::<PersonKind>)
                .transpose()
                .map_err(|err| ApiResponse::invalid(422, "personKind", err.to_string()))?;
            let filter = RecordFilter {
                zone_id: req.zone_id,
                person_kind,
                from: req.from,
                to: req.to,
                limit: req.limit,
                offset: req.offset,
            };
            Ok(ApiResponse::ok(self.ledger.query_records(&filter)?))
        })
    }

    pub fn analytics(&self, _body: &str) -> ApiResponse {
        match self.ledger.analytics(Utc::now()) {
            Ok(analytics) => ApiResponse::ok(analytics),
            Err(err) => err.into(),
        }
    }
}
