//! Job identifiers and pluggable id generation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque identifier of a tracked job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        JobId(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

/// Source of job ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> JobId;
}

/// Random UUID v4 ids (the default)
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> JobId {
        JobId(Uuid::new_v4().to_string())
    }
}

/// Monotonic `prefix-N` ids, handy for tests and readable logs
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> JobId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        JobId(format!("{}-{}", self.prefix, n))
    }
}

impl<F> IdGenerator for F
where
    F: Fn() -> JobId + Send + Sync,
{
    fn next_id(&self) -> JobId {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new("job");
        assert_eq!(ids.next_id().as_str(), "job-1");
        assert_eq!(ids.next_id().as_str(), "job-2");
    }

    #[test]
    fn test_uuid_ids_are_distinct() {
        let ids = UuidIdGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn test_closure_generator() {
        let fixed = || JobId::new("fixed");
        assert_eq!(fixed.next_id(), JobId::from("fixed"));
    }
}
