use crate::error::PreconditionError;
use crate::models::{Anomaly, Event, SequencePatch};


/// Longest pause (seconds) between two events of the same session
pub const GAP_THRESHOLD_SECONDS: i64 = 360;

/// Same-URL repeats faster than this (seconds) count as bot traffic
pub const BOT_TRAFFIC_THRESHOLD_SECONDS: i64 = 1;

/// Pass 1 result for one user's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOutcome {
    /// One patch per input event, in input order
    pub patches: Vec<SequencePatch>,
    pub anomalies: Vec<Anomaly>,
}

impl SequenceOutcome {
    /// Number of multi-event sessions found
    pub fn session_count(&self) -> usize {
        self.patches
            .iter()
            .filter(|p| p.root_event_id == Some(p.event_id))
            .count()
    }
}

/// Groups one user's chronologically ordered events into sessions.
///
/// A session is a run of events no more than [`GAP_THRESHOLD_SECONDS`] apart.
/// Only runs of two or more events keep a root event id; a lone event (at the
/// start, between two gaps, or at the end of the stream) ends up unrooted.
/// Input order is trusted, never re-sorted.
pub fn build_sequences(user: &str, events: &[Event]) -> Result<SequenceOutcome, PreconditionError> {
    if events.is_empty() {
        return Err(PreconditionError::EmptyGroup {
            key: user.to_string(),
        });
    }
    if let Some(other) = events.iter().find(|e| e.user_identifier != user) {
        return Err(PreconditionError::MixedUsers {
            event_id: other.id,
            expected: user.to_string(),
            found: other.user_identifier.clone(),
        });
    }

    let last = events.len() - 1;
    let mut patches: Vec<SequencePatch> = events.iter().map(|e| SequencePatch::new(e.id)).collect();
    let mut anomalies = Vec::new();
    // index of the first event of the open session
    let mut start = 0;

    for (idx, event) in events.iter().enumerate() {
        let is_last = idx == last;
        patches[idx].root_event_id = Some(events[start].id);

        if idx == start {
            if is_last {
                patches[idx].root_event_id = None;
            }
            continue;
        }

        let previous = &events[idx - 1];
        let diff = (event.creation_date - previous.creation_date).num_seconds();
        if diff < 0 {
            anomalies.push(Anomaly::NegativeDiff {
                event_id: event.id,
                diff_seconds: diff,
            });
        } else {
            patches[idx].diff_seconds = Some(diff);
        }

        if diff > GAP_THRESHOLD_SECONDS {
            if idx - start == 1 {
                // closed session held a single event
                patches[idx - 1].root_event_id = None;
            }
            patches[idx].root_event_id = if is_last { None } else { Some(event.id) };
            start = idx;
        } else {
            patches[idx].bot_traffic = is_bot_traffic(patches[idx].diff_seconds, previous, event);
            patches[idx].gap_in_sequence = has_gap(previous, event);
        }
    }

    Ok(SequenceOutcome { patches, anomalies })
}

/// Near-instant repeat access of the same URL
pub fn is_bot_traffic(diff_seconds: Option<i64>, previous: &Event, event: &Event) -> bool {
    match diff_seconds {
        Some(diff) => {
            diff < BOT_TRAFFIC_THRESHOLD_SECONDS && event.url.trim() == previous.url.trim()
        }
        None => false,
    }
}

/// Broken source/target chain, or a referrer that is not a prefix of the
/// previous URL (referrers are often truncated upstream)
pub fn has_gap(previous: &Event, event: &Event) -> bool {
    previous.event_target != event.event_source || !previous.url.starts_with(&event.referrer)
}
