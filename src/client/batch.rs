//! Aggregated result of a batch read.

use crate::error::{Error, Result};
use crate::types::VersionedValue;
use bytes::Bytes;
use std::collections::HashMap;

/// Per-key outcome of [`StoreClient::batch_get`](super::StoreClient::batch_get).
#[derive(Debug, Default)]
pub struct BatchGetResponse {
    results: HashMap<Bytes, Result<Option<VersionedValue>>>,
}

impl BatchGetResponse {
    pub(crate) fn new(results: HashMap<Bytes, Result<Option<VersionedValue>>>) -> Self {
        Self { results }
    }

    /// Outcome for `key`, or `None` if it was not part of the batch.
    pub fn get(&self, key: &[u8]) -> Option<&Result<Option<VersionedValue>>> {
        self.results.get(key)
    }

    /// The value of `key` if it was found.
    pub fn value(&self, key: &[u8]) -> Option<&Bytes> {
        match self.results.get(key) {
            Some(Ok(Some(value))) => Some(&value.value),
            _ => None,
        }
    }

    /// Number of distinct keys in the batch.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn found(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count()
    }

    pub fn absent(&self) -> usize {
        self.results.values().filter(|r| matches!(r, Ok(None))).count()
    }

    /// Keys whose lookup failed, with their errors.
    pub fn failed(&self) -> impl Iterator<Item = (&Bytes, &Error)> + '_ {
        self.results.iter().filter_map(|(key, result)| match result {
            Err(e) => Some((key, e)),
            Ok(_) => None,
        })
    }

    pub fn into_results(self) -> HashMap<Bytes, Result<Option<VersionedValue>>> {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_accessors() {
        let mut results = HashMap::new();
        results.insert(
            Bytes::from_static(b"a"),
            Ok(Some(VersionedValue {
                schema_id: 1,
                value: Bytes::from_static(b"1"),
            })),
        );
        results.insert(Bytes::from_static(b"b"), Ok(None));
        results.insert(
            Bytes::from_static(b"c"),
            Err(Error::Timeout {
                elapsed: Duration::from_millis(500),
            }),
        );
        let response = BatchGetResponse::new(results);

        assert_eq!(response.len(), 3);
        assert_eq!(response.found(), 1);
        assert_eq!(response.absent(), 1);
        assert_eq!(response.value(b"a"), Some(&Bytes::from_static(b"1")));
        assert_eq!(response.value(b"b"), None);
        assert!(response.get(b"zzz").is_none());

        let failed: Vec<_> = response.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, &Bytes::from_static(b"c"));
    }
}
