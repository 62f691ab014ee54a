//! Lifecycle event kinds and the fixed per-kind sequence map.
//!
//! Sequences are producer-assigned and per-evaluation. Retries of the same
//! step re-emit the same sequence; the storage worker deduplicates on
//! `(eval_id, sequence)`, which is what makes at-least-once delivery safe.

use serde::{Deserialize, Serialize};

/// What happened. Topic names on the bus are derived from this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Provisioning,
    Running,
    Completed,
    Failed,
    /// Cleanup controller deleted (or decided about) a workload. Not part of
    /// the evaluation lifecycle; never appended to the events table.
    #[serde(rename = "workload.cleaned")]
    WorkloadCleaned,
    /// Durable fence: the storage worker finished a write for this id.
    #[serde(rename = "storage.updated")]
    StorageUpdated,
}

impl EventKind {
    /// Dotted bus topic.
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::Queued => "evaluation.queued",
            EventKind::Provisioning => "evaluation.provisioning",
            EventKind::Running => "evaluation.running",
            EventKind::Completed => "evaluation.completed",
            EventKind::Failed => "evaluation.failed",
            EventKind::WorkloadCleaned => "workload.cleaned",
            EventKind::StorageUpdated => "storage.updated",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Queued => "queued",
            EventKind::Provisioning => "provisioning",
            EventKind::Running => "running",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::WorkloadCleaned => "workload.cleaned",
            EventKind::StorageUpdated => "storage.updated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => EventKind::Queued,
            "provisioning" => EventKind::Provisioning,
            "running" => EventKind::Running,
            "completed" => EventKind::Completed,
            "failed" => EventKind::Failed,
            "workload.cleaned" => EventKind::WorkloadCleaned,
            "storage.updated" => EventKind::StorageUpdated,
            _ => return None,
        })
    }

    /// True for the kinds the storage worker reduces into the evaluation row
    /// and appends to the events table.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::Queued
                | EventKind::Provisioning
                | EventKind::Running
                | EventKind::Completed
                | EventKind::Failed
        )
    }
}

/// Per-evaluation sequence for a lifecycle kind.
///
/// queued=1, provisioning=2, running=3, terminal=4. Both terminal kinds share
/// sequence 4: exactly one of them wins the `(eval_id, 4)` slot, which is how
/// "exactly one of completed/failed" survives duplicate callbacks.
pub fn lifecycle_sequence(kind: EventKind) -> Option<u64> {
    match kind {
        EventKind::Queued => Some(1),
        EventKind::Provisioning => Some(2),
        EventKind::Running => Some(3),
        EventKind::Completed | EventKind::Failed => Some(4),
        EventKind::WorkloadCleaned | EventKind::StorageUpdated => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_sequences_are_strictly_increasing_along_the_happy_path() {
        let path = [
            EventKind::Queued,
            EventKind::Provisioning,
            EventKind::Running,
            EventKind::Completed,
        ];
        let seqs: Vec<u64> = path.iter().map(|k| lifecycle_sequence(*k).unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    }

    #[test]
    fn terminal_kinds_share_one_sequence_slot() {
        assert_eq!(
            lifecycle_sequence(EventKind::Completed),
            lifecycle_sequence(EventKind::Failed)
        );
    }

    #[test]
    fn non_lifecycle_kinds_have_no_sequence() {
        assert_eq!(lifecycle_sequence(EventKind::WorkloadCleaned), None);
        assert_eq!(lifecycle_sequence(EventKind::StorageUpdated), None);
    }
}
