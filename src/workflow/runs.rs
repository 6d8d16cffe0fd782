//! In-memory registry of workflow runs for status queries.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running {
        stage: String,
        completed_stages: usize,
    },
    Succeeded {
        /// Output of the last stage.
        #[schema(value_type = Object)]
        output: Value,
    },
    Failed {
        stage: String,
        error: String,
    },
}

impl WorkflowStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, WorkflowStatus::Running { .. })
    }
}

/// Status of one run as reported by the API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowRunInfo {
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(flatten)]
    pub status: WorkflowStatus,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

struct RunEntry {
    name: &'static str,
    started_at_ms: u64,
    finished_at_ms: Option<u64>,
    status: watch::Receiver<WorkflowStatus>,
}

#[derive(Default)]
struct RunsInner {
    entries: HashMap<String, RunEntry>,
    /// Finished run ids, oldest first.
    finished: VecDeque<String>,
}

/// Keeps every running workflow and the most recent `history_limit` finished
/// ones.
pub struct WorkflowRuns {
    inner: Mutex<RunsInner>,
    history_limit: usize,
}

impl WorkflowRuns {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(RunsInner::default()),
            history_limit,
        }
    }

    pub fn register(&self, id: &str, name: &'static str, status: watch::Receiver<WorkflowStatus>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.insert(
            id.to_string(),
            RunEntry {
                name,
                started_at_ms: epoch_millis(),
                finished_at_ms: None,
                status,
            },
        );
    }

    /// Record that a run reached a terminal status and evict the oldest
    /// finished runs beyond the history limit.
    pub fn mark_finished(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = inner.entries.get_mut(id) else {
            return;
        };
        if entry.finished_at_ms.is_some() {
            return;
        }
        entry.finished_at_ms = Some(epoch_millis());
        inner.finished.push_back(id.to_string());
        while inner.finished.len() > self.history_limit {
            if let Some(evicted) = inner.finished.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkflowRunInfo> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(id).map(|entry| WorkflowRunInfo {
            workflow_id: id.to_string(),
            workflow_name: entry.name.to_string(),
            status: entry.status.borrow().clone(),
            started_at_ms: entry.started_at_ms,
            finished_at_ms: entry.finished_at_ms,
        })
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn running() -> WorkflowStatus {
        WorkflowStatus::Running {
            stage: "split".to_string(),
            completed_stages: 0,
        }
    }

    #[test]
    fn test_status_follows_channel() {
        let runs = WorkflowRuns::new(10);
        let (tx, rx) = watch::channel(running());
        runs.register("w1", "video", rx);
        assert_eq!(runs.get("w1").unwrap().status, running());

        tx.send_replace(WorkflowStatus::Succeeded {
            output: json!({"merged": "out.mp4"}),
        });
        runs.mark_finished("w1");
        let info = runs.get("w1").unwrap();
        assert!(info.status.is_finished());
        assert!(info.finished_at_ms.is_some());
        assert!(runs.get("w2").is_none());
    }

    #[test]
    fn test_evicts_oldest_finished() {
        let runs = WorkflowRuns::new(2);
        let mut senders = Vec::new();
        for id in ["a", "b", "c", "d"] {
            let (tx, rx) = watch::channel(running());
            runs.register(id, "svd", rx);
            senders.push(tx);
        }
        runs.mark_finished("a");
        runs.mark_finished("b");
        runs.mark_finished("c");
        // "d" is still running and never evicted
        assert!(runs.get("a").is_none());
        assert!(runs.get("b").is_some());
        assert!(runs.get("c").is_some());
        assert!(runs.get("d").is_some());
        assert_eq!(runs.len(), 3);
    }

    #[test]
    fn test_serializes_flat() {
        let info = WorkflowRunInfo {
            workflow_id: "w1".to_string(),
            workflow_name: "svd".to_string(),
            status: WorkflowStatus::Failed {
                stage: "compute".to_string(),
                error: "boom".to_string(),
            },
            started_at_ms: 1,
            finished_at_ms: Some(2),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["stage"], "compute");
        assert_eq!(value["workflow_name"], "svd");
    }
}
