use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::notifier::{Digest, Transport};

/// Transport that keeps every digest it is handed and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Digest>>>,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Delivery attempts, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_subject(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|d| d.subject.clone())
    }

    pub fn last_body(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|d| d.body.clone())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn channel(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, digest: &Digest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("smtp unavailable"));
        }
        self.sent.lock().unwrap().push(digest.clone());
        Ok(())
    }
}
