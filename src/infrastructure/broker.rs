use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::{BrokerError, GroupName, Message, Result, TopicName, TopicStats};
use crate::infrastructure::guard::ExecutionGuard;
use crate::infrastructure::topic::Topic;
use crate::settings::BrokerSettings;

/// Thin orchestration over a registry of topics.
///
/// All message operations delegate to the named `Topic`; the broker's own
/// state is the registry and the guard that makes `stop` exactly-once. The
/// registry lock is deliberately coarse: topic lookup is administrative and
/// atomic create-if-absent matters more than throughput here.
#[derive(Debug)]
pub struct MessageBroker {
    settings: BrokerSettings,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    guard: ExecutionGuard,
}

impl MessageBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            topics: Mutex::new(HashMap::new()),
            guard: ExecutionGuard::new(),
        }
    }

    /// Creates the topic if it does not exist. Idempotent: a second call for
    /// the same name is a no-op. Returns `false` when the broker is stopping.
    pub fn create_topic(&self, topic: &str) -> Result<bool> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(false);
        };
        self.topic_or_create(topic)?;
        Ok(true)
    }

    /// Appends to `topic`, creating it on demand. `None` when the broker (or
    /// the topic) is stopping.
    pub fn produce(
        &self,
        topic: &str,
        meta: &str,
        body: &[u8],
    ) -> Result<Option<(u64, DateTime<Utc>)>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };
        self.topic_or_create(topic)?.produce(meta, body)
    }

    /// Reads the next message for a consumer group.
    pub fn consume_group(&self, topic: &str, group: &str) -> Result<Option<Message>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };
        let group = GroupName::new(group)?;
        self.existing_topic(topic)?.consume_group(&group)
    }

    /// Random access read at `offset`.
    pub fn consume_at(&self, topic: &str, offset: u64) -> Result<Option<Message>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };
        self.existing_topic(topic)?.consume_at(offset)
    }

    /// Metadata-only read at `offset`; the body is never loaded.
    pub fn peek(&self, topic: &str, offset: u64) -> Result<Option<Message>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };
        self.existing_topic(topic)?.peek(offset)
    }

    /// Moves a group's cursor to an explicit offset. Returns `false` when the
    /// broker is stopping.
    pub fn set_offset(&self, topic: &str, group: &str, offset: u64) -> Result<bool> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(false);
        };
        let group = GroupName::new(group)?;
        self.existing_topic(topic)?.set_offset(&group, offset)
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.topics).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn topic_statistics(&self) -> Vec<TopicStats> {
        let topics: Vec<Arc<Topic>> = lock(&self.topics).values().cloned().collect();
        let mut stats: Vec<TopicStats> = topics.iter().map(|t| t.stats()).collect();
        stats.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        stats
    }

    /// Closes every topic after draining in-flight operations. Errors with
    /// `AlreadyStopped` when called a second time.
    pub fn stop(&self) -> Result<()> {
        if !self.guard.disable_execute() {
            return Err(BrokerError::AlreadyStopped);
        }
        let mut topics = lock(&self.topics);
        for topic in topics.values() {
            topic.close();
        }
        topics.clear();
        info!("broker stopped");
        Ok(())
    }

    fn topic_or_create(&self, topic: &str) -> Result<Arc<Topic>> {
        let mut topics = lock(&self.topics);
        if let Some(existing) = topics.get(topic) {
            return Ok(Arc::clone(existing));
        }
        let name = TopicName::new(topic)?;
        debug!("creating topic '{name}'");
        let created = Arc::new(Topic::open(
            &self.settings.storage_dir,
            name,
            self.settings.segment_split,
        )?);
        topics.insert(topic.to_string(), Arc::clone(&created));
        Ok(created)
    }

    fn existing_topic(&self, topic: &str) -> Result<Arc<Topic>> {
        lock(&self.topics)
            .get(topic)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        // second stop() is the error case, a drop after stop is not
        let _ = self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
