use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::frame::Frame;

pub type ZoneId = i64;
pub type CameraId = i64;
pub type RecordId = i64;
pub type UnknownId = i64;

/// Notes stored on an unknown detection when the reporter supplies none.
pub const DEFAULT_UNKNOWN_NOTES: &str = "Unknown person detected";

/// The two kinds of people the registry knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PersonKind {
    Student,
    Teacher,
}

impl PersonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonKind::Student => "STUDENT",
            PersonKind::Teacher => "TEACHER",
        }
    }
}

impl fmt::Display for PersonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown person kind {0:?} (expected STUDENT or TEACHER)")]
pub struct UnknownPersonKind(pub String);

impl FromStr for PersonKind {
    type Err = UnknownPersonKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STUDENT" => Ok(PersonKind::Student),
            "TEACHER" => Ok(PersonKind::Teacher),
            other => Err(UnknownPersonKind(other.to_string())),
        }
    }
}

/// Identity of a person in the external registry. Carries no profile data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonRef {
    pub kind: PersonKind,
    pub id: i64,
}

impl PersonRef {
    pub fn new(kind: PersonKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn student(id: i64) -> Self {
        Self::new(PersonKind::Student, id)
    }

    pub fn teacher(id: i64) -> Self {
        Self::new(PersonKind::Teacher, id)
    }
}

impl fmt::Display for PersonRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)
    }
}

/// One tracked stay of a person in a zone.
///
/// A record with `exit_time == None` is open: the person is considered inside.
/// An exit-only record has `entry_time == None` and was created by an exit
/// that found nothing to close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: RecordId,
    pub person: PersonRef,
    pub zone_id: Option<ZoneId>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub camera_id: Option<CameraId>,
}

impl PresenceRecord {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }

    pub fn is_exit_only(&self) -> bool {
        self.entry_time.is_none()
    }

    /// Time spent inside, for closed records that have both ends.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.entry_time, self.exit_time) {
            (Some(entry), Some(exit)) => Some(exit - entry),
            _ => None,
        }
    }

    /// Stay length rounded to the nearest whole minute.
    pub fn duration_minutes(&self) -> Option<i64> {
        self.duration()
            .map(|d| (d.num_milliseconds() as f64 / 60_000.0).round() as i64)
    }
}

/// Review state of an unknown-face capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnknownStatus {
    Pending,
    Identified,
    Ignored,
}

impl UnknownStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnknownStatus::Pending => "PENDING",
            UnknownStatus::Identified => "IDENTIFIED",
            UnknownStatus::Ignored => "IGNORED",
        }
    }

    /// `IDENTIFIED` and `IGNORED` are set by a reviewer and never change on their own.
    pub fn is_reviewed(&self) -> bool {
        !matches!(self, UnknownStatus::Pending)
    }
}

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status {0:?}; must be PENDING, IDENTIFIED, or IGNORED")]
pub struct InvalidUnknownStatus(pub String);

impl FromStr for UnknownStatus {
    type Err = InvalidUnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(UnknownStatus::Pending),
            "IDENTIFIED" => Ok(UnknownStatus::Identified),
            "IGNORED" => Ok(UnknownStatus::Ignored),
            other => Err(InvalidUnknownStatus(other.to_string())),
        }
    }
}

/// An admitted sighting of a face the matcher could not identify.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownDetection {
    pub id: UnknownId,
    pub zone_id: ZoneId,
    /// Encoded face crop (JPEG).
    pub captured_image: Vec<u8>,
    pub confidence: f32,
    pub detected_time: DateTime<Utc>,
    pub status: UnknownStatus,
    pub notes: String,
}

/// Input for persisting a new unknown detection. Always stored as `PENDING`.
#[derive(Debug, Clone)]
pub struct NewUnknownDetection {
    pub zone_id: ZoneId,
    pub captured_image: Vec<u8>,
    pub confidence: f32,
    pub notes: Option<String>,
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// One face reported by the external detector/matcher.
///
/// `person` is `None` when the matcher found no gallery entry within its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub person: Option<PersonRef>,
}

impl Detection {
    pub fn recognized(person: PersonRef, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            person: Some(person),
        }
    }

    pub fn unknown(bbox: BoundingBox) -> Self {
        Self { bbox, person: None }
    }
}

/// A sampled frame together with everything the matcher found in it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}
