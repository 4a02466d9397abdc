//! presence-core — Domain types and admission disciplines for zone presence tracking.
//!
//! Holds the person/record model shared by the daemon and CLI, the
//! recognition dedup cache, the unknown-face cooldown gate, and the frame
//! cropping used to store unknown-face captures.

pub mod admission;
pub mod dedup;
pub mod frame;
pub mod types;

pub use admission::UnknownCooldown;
pub use dedup::RecognitionCache;
pub use frame::{Frame, FrameError};
pub use types::{
    BoundingBox, CameraId, Detection, NewUnknownDetection, Observation, PersonKind, PersonRef,
    PresenceRecord, RecordId, UnknownDetection, UnknownId, UnknownStatus, ZoneId,
};
