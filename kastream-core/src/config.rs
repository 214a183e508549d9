use std::sync::Arc;
use std::time::Duration;

use crate::codec::TopicSerdes;
use crate::error::{Error, Result};

const DEFAULT_MAX_IN_FLIGHT_MESSAGE_GROUPS: usize = 1000;
const DEFAULT_AUTO_MARK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Offset commit discipline. Exactly one is active per processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Offsets advance for every completed prefix of in-flight groups.
    #[default]
    Automatic,
    /// Offsets advance only for completed groups whose processing requested a
    /// commit through the [Coordinator](crate::Coordinator).
    Manual,
}

/// Per-partition-processor settings.
#[derive(Clone)]
pub struct Settings {
    /// Input topics, in fan-in order. Every entry must have a codec in
    /// `topic_serdes`.
    pub input_topics: Vec<String>,
    /// Per-topic backpressure bound on in-flight groups. The readiness check
    /// is `len <= max`, so the bound is soft: the queue can reach `max + 1`
    /// before the first not-ready answer is observed.
    pub max_in_flight_message_groups: usize,
    pub commit_mode: CommitMode,
    /// Codec registry for input and output topics.
    pub topic_serdes: Arc<TopicSerdes>,
    /// How often the worker sweeps completed prefixes into offset marks even
    /// when no ack has arrived (covers groups that produced nothing).
    pub auto_mark_interval: Duration,
    /// How long shutdown waits for pending produce acks before closing.
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_topics: Vec::new(),
            max_in_flight_message_groups: DEFAULT_MAX_IN_FLIGHT_MESSAGE_GROUPS,
            commit_mode: CommitMode::default(),
            topic_serdes: Arc::new(TopicSerdes::new()),
            auto_mark_interval: DEFAULT_AUTO_MARK_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.input_topics.is_empty() {
            return Err(Error::Config("At least one input topic is required".into()));
        }
        for topic in &self.input_topics {
            if !self.topic_serdes.contains_key(topic) {
                return Err(Error::Config(format!(
                    "No codec registered for input topic '{topic}'"
                )));
            }
        }
        Ok(())
    }
}
