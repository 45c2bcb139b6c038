//! Structural normalization of results and progress values
//!
//! Values coming from the fast path and from worker processes both pass
//! through an encode/decode round trip, so observers always see plain JSON
//! data whichever path produced it. Fields a type marks as skipped vanish and
//! non-finite floats become `null`, matching what the wire would carry.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// Round-trip a value through its JSON encoding.
pub fn normalize<T: Serialize + ?Sized>(value: &T) -> Result<JsonValue, serde_json::Error> {
    let encoded = serde_json::to_vec(value)?;
    serde_json::from_slice(&encoded)
}
