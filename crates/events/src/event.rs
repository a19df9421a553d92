use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A domain-agnostic event (usually an enum over a domain's payload structs).
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **tagged** with a stable type identifier used for dispatch
/// - designed to be **append-only**
///
/// The stored payload is the JSON of the variant's payload struct; the type tag
/// travels next to it in the envelope, so decoding is a lookup by tag.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Every type tag this event type knows how to decode.
    const EVENT_TYPES: &'static [&'static str];

    /// Stable event name/type identifier (e.g. "issues.issue.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the variant's payload (without the tag).
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error>;

    /// Decode a stored payload by its type tag.
    ///
    /// Returns `Ok(None)` for tags this type does not know: an unknown event is
    /// skipped by consumers, never an error.
    fn from_payload(event_type: &str, payload: &JsonValue) -> Result<Option<Self>, serde_json::Error>;

    fn handles(event_type: &str) -> bool {
        Self::EVENT_TYPES.contains(&event_type)
    }
}

/// A single event payload type with a fixed tag.
///
/// Projection handlers are registered per `EventType`, which is the Rust
/// counterpart of registering a handler for one concrete event class.
pub trait EventType: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Decode a payload into a concrete [`EventType`].
pub fn decode_payload<S: EventType>(payload: &JsonValue) -> Result<S, serde_json::Error> {
    S::deserialize(payload)
}
