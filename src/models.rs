use chrono::{DateTime, Utc};

/// Event as fetched from the store (read-only snapshot)
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub root_event_id: Option<i64>,
    pub user_identifier: String,
    pub creation_date: DateTime<Utc>,
    pub diff_seconds: Option<i64>,
    pub event_source: String,
    pub event_target: String,
    pub referrer: String,
    pub url: String,
    pub query: Option<String>,
    pub fragment_identifier: Option<String>,
    pub normalized_referrer: Option<String>,
    pub normalized_url: Option<String>,
    pub bot_traffic: bool,
    pub gap_in_sequence: bool,
    pub page_refresh: bool,
}

impl Event {
    /// Whether the event's target is a content page view
    pub fn targets_post(&self) -> bool {
        self.event_target == POST_TARGET
    }
}

/// Event target denoting a content page view
pub const POST_TARGET: &str = "Post";

/// Pass 1 result for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePatch {
    pub event_id: i64,
    pub root_event_id: Option<i64>,
    pub diff_seconds: Option<i64>,
    pub bot_traffic: bool,
    pub gap_in_sequence: bool,
}

impl SequencePatch {
    pub fn new(event_id: i64) -> Self {
        Self {
            event_id,
            root_event_id: None,
            diff_seconds: None,
            bot_traffic: false,
            gap_in_sequence: false,
        }
    }
}

/// Pass 2 result for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationPatch {
    pub event_id: i64,
    pub normalized_url: Option<String>,
    pub normalized_referrer: Option<String>,
    pub page_refresh: bool,
    pub query: Option<String>,
    pub fragment_identifier: Option<String>,
}

impl AnnotationPatch {
    pub fn new(event_id: i64) -> Self {
        Self {
            event_id,
            normalized_url: None,
            normalized_referrer: None,
            page_refresh: false,
            query: None,
            fragment_identifier: None,
        }
    }
}

/// Recoverable data problem found while deriving fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    NegativeDiff { event_id: i64, diff_seconds: i64 },
    UnnormalizableUrl { event_id: i64, reason: String },
}

impl Anomaly {
    pub fn event_id(&self) -> i64 {
        match self {
            Anomaly::NegativeDiff { event_id, .. } => *event_id,
            Anomaly::UnnormalizableUrl { event_id, .. } => *event_id,
        }
    }
}

/// Per-shard statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardReport {
    pub partition: usize,
    pub keys_read: usize,
    pub keys_processed: usize,
    pub keys_failed: usize,
    pub events_processed: usize,
    pub cancelled: bool,
}
