//! Secondary read path double.

use crate::dual_read::SecondaryClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct MockSecondary {
    data: DashMap<Bytes, Bytes>,
    hang: AtomicBool,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockSecondary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.data.insert(key.into(), value.into());
    }

    /// Never answer.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecondaryClient for MockSecondary {
    async fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal("secondary unavailable".into()));
        }
        Ok(self.data.get(&key).map(|v| v.clone()))
    }
}
