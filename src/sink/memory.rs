use super::{Result, Sink, SinkError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-process sink that keeps every published message.
///
/// Readiness and failures can be switched at runtime, which makes it the
/// sink of choice for exercising backpressure and retry paths.
#[derive(Debug)]
pub struct MemorySink {
    topics: Mutex<BTreeSet<String>>,
    messages: Mutex<HashMap<String, Vec<String>>>,
    ready: AtomicBool,
    failing: AtomicBool,
    publish_attempts: AtomicUsize,
    readiness_checks: AtomicUsize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(BTreeSet::new()),
            messages: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            publish_attempts: AtomicUsize::new(0),
            readiness_checks: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// While failing, every call returns a transport error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn readiness_checks(&self) -> usize {
        self.readiness_checks.load(Ordering::SeqCst)
    }

    /// Poll until `topic` holds at least `count` messages or `timeout` passes
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published(topic);
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("memory sink set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        self.check_failing()?;
        if let Ok(mut topics) = self.topics.lock() {
            topics.insert(topic.to_string());
        }
        Ok(())
    }

    async fn is_ready(&self, _topic: &str) -> Result<bool> {
        self.readiness_checks.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn publish(&self, topic: &str, messages: &[String]) -> Result<()> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        let mut stored = self
            .messages
            .lock()
            .map_err(|_| SinkError::Unavailable("memory sink poisoned".to_string()))?;
        stored
            .entry(topic.to_string())
            .or_default()
            .extend(messages.iter().cloned());
        Ok(())
    }
}
