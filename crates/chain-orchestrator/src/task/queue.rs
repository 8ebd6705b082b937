//! Priority-bucketed task queue.

use super::{Task, TaskPriority, TaskResult, TaskStatus};
use crate::error::{Error, Result};
use crate::types::{TaskId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub queued: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
}

impl TaskStats {
    fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::Scheduled => &mut self.scheduled,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
            TaskStatus::Timeout => &mut self.timeout,
        };
        *slot += 1;
    }
}

struct Entry {
    task: Task,
    status: TaskStatus,
    result: Option<TaskResult>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<TaskId, Entry>,
    /// One FIFO per priority, indexed by `TaskPriority::as_u8`.
    buckets: [VecDeque<TaskId>; TaskPriority::COUNT],
}

impl QueueState {
    fn bucket_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<TaskId> {
        &mut self.buckets[priority.as_u8() as usize]
    }

    fn detach(&mut self, id: &TaskId, priority: TaskPriority) {
        self.bucket_mut(priority).retain(|queued| queued != id);
    }
}

/// In-memory task store with priority ordering.
///
/// All operations take a single short lock, so `get_next_task` claims a task
/// atomically: once flipped to `Scheduled` it can't be handed out again.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task with status `Pending`.
    pub fn add_task(&self, task: Task) -> Result<()> {
        let mut state = self.state.lock();
        if state.entries.contains_key(&task.id) {
            return Err(Error::TaskAlreadyExists {
                task_id: task.id.clone(),
            });
        }
        let id = task.id.clone();
        let priority = task.priority;
        state.entries.insert(
            id.clone(),
            Entry {
                task,
                status: TaskStatus::Pending,
                result: None,
            },
        );
        state.bucket_mut(priority).push_back(id);
        Ok(())
    }

    /// Drop a task from the lookup map and its bucket. Returns whether it existed.
    pub fn remove_task(&self, id: &TaskId) -> bool {
        let mut state = self.state.lock();
        match state.entries.remove(id) {
            Some(entry) => {
                state.detach(id, entry.task.priority);
                true
            }
            None => false,
        }
    }

    /// Claim the highest-priority ready task, oldest first within a priority.
    pub fn get_next_task(&self) -> Option<Task> {
        let mut state = self.state.lock();
        let QueueState { entries, buckets } = &mut *state;

        for priority in TaskPriority::descending() {
            let bucket = &buckets[priority.as_u8() as usize];
            for id in bucket {
                let Some(entry) = entries.get_mut(id) else {
                    continue;
                };
                if entry.status.is_ready() {
                    entry.status = TaskStatus::Scheduled;
                    return Some(entry.task.clone());
                }
            }
        }
        None
    }

    /// Set a task's status. Running and terminal transitions stamp the task's
    /// lifecycle timestamps.
    pub fn update_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound {
                task_id: id.clone(),
            })?;

        let now = Timestamp::now();
        if status == TaskStatus::Running {
            entry.task.started_at = Some(now);
        }
        if status.is_terminal() {
            entry.task.completed_at = Some(now);
        }
        entry.status = status;

        // Cancelled work is never handed out again; drop it from scheduling.
        if status == TaskStatus::Cancelled {
            let priority = entry.task.priority;
            state.detach(id, priority);
        }
        Ok(())
    }

    /// Check that a task can still be dispatched and mark it `Running` under
    /// the same lock. A second claim on the same task fails.
    pub fn claim(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound {
                task_id: id.clone(),
            })?;
        if entry.status == TaskStatus::Running || entry.status.is_terminal() {
            return Err(Error::TaskNotRunnable {
                task_id: id.clone(),
                status: entry.status,
            });
        }
        entry.status = TaskStatus::Running;
        entry.task.started_at = Some(Timestamp::now());
        Ok(entry.task.clone())
    }

    /// Store the result of an execution and adopt its status.
    pub fn set_result(&self, result: TaskResult) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&result.task_id)
            .ok_or_else(|| Error::TaskNotFound {
                task_id: result.task_id.clone(),
            })?;
        entry.status = result.status;
        entry.task.started_at = Some(result.started_at);
        entry.task.completed_at = Some(result.completed_at);
        entry.result = Some(result);
        Ok(())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.state.lock().entries.get(id).map(|entry| entry.task.clone())
    }

    pub fn get_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.state.lock().entries.get(id).map(|entry| entry.status)
    }

    pub fn get_result(&self, id: &TaskId) -> Option<TaskResult> {
        self.state
            .lock()
            .entries
            .get(id)
            .and_then(|entry| entry.result.clone())
    }

    pub fn get_stats(&self) -> TaskStats {
        let state = self.state.lock();
        let mut stats = TaskStats::default();
        for entry in state.entries.values() {
            stats.record(entry.status);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every task in a terminal status. Returns how many were removed.
    pub fn remove_terminal(&self) -> usize {
        let mut state = self.state.lock();
        let finished: Vec<(TaskId, TaskPriority)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.status.is_terminal())
            .map(|(id, entry)| (id.clone(), entry.task.priority))
            .collect();

        for (id, priority) in &finished {
            state.entries.remove(id);
            state.detach(id, *priority);
        }
        finished.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        for bucket in state.buckets.iter_mut() {
            bucket.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;
    use pretty_assertions::assert_eq;

    fn task(id: &str, priority: TaskPriority) -> Task {
        Task::new(id, id, TaskPayload::Custom {
            action: "noop".into(),
            params: serde_json::Value::Null,
        })
        .with_priority(priority)
    }

    fn drain(queue: &TaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.get_next_task())
            .map(|task| task.id.to_string())
            .collect()
    }

    #[test]
    fn test_priority_beats_submission_order() {
        let queue = TaskQueue::new();
        queue.add_task(task("T1", TaskPriority::Low)).unwrap();
        queue.add_task(task("T2", TaskPriority::Critical)).unwrap();
        queue.add_task(task("T3", TaskPriority::Normal)).unwrap();

        assert_eq!(drain(&queue), vec!["T2", "T3", "T1"]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = TaskQueue::new();
        for id in ["a", "b", "c"] {
            queue.add_task(task(id, TaskPriority::High)).unwrap();
        }
        assert_eq!(drain(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_claimed_task_is_not_returned_twice() {
        let queue = TaskQueue::new();
        queue.add_task(task("only", TaskPriority::Normal)).unwrap();

        let first = queue.get_next_task().unwrap();
        assert_eq!(queue.get_status(&first.id), Some(TaskStatus::Scheduled));
        assert!(queue.get_next_task().is_none());

        queue.update_task_status(&first.id, TaskStatus::Running).unwrap();
        assert!(queue.get_next_task().is_none());

        // Back to queued after a failed dispatch: eligible again
        queue.update_task_status(&first.id, TaskStatus::Queued).unwrap();
        assert_eq!(queue.get_next_task().unwrap().id, first.id);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        queue.add_task(task("race", TaskPriority::High)).unwrap();
        let id = TaskId::from("race");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let id = id.clone();
                std::thread::spawn(move || queue.claim(&id).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(queue.get_status(&id), Some(TaskStatus::Running));
        assert!(queue.get_task(&id).unwrap().started_at.is_some());

        let err = queue.claim(&id).unwrap_err();
        assert!(matches!(
            err,
            Error::TaskNotRunnable {
                status: TaskStatus::Running,
                ..
            }
        ));
        assert!(matches!(
            queue.claim(&TaskId::from("ghost")),
            Err(Error::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let queue = TaskQueue::new();
        queue.add_task(task("t", TaskPriority::Low)).unwrap();
        let err = queue.add_task(task("t", TaskPriority::High)).unwrap_err();
        assert!(matches!(err, Error::TaskAlreadyExists { .. }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_detaches_from_bucket() {
        let queue = TaskQueue::new();
        queue.add_task(task("x", TaskPriority::Critical)).unwrap();
        queue.add_task(task("y", TaskPriority::Low)).unwrap();

        assert!(queue.remove_task(&TaskId::from("x")));
        assert!(!queue.remove_task(&TaskId::from("x")));
        assert_eq!(drain(&queue), vec!["y"]);
    }

    #[test]
    fn test_update_unknown_task_fails() {
        let queue = TaskQueue::new();
        let err = queue
            .update_task_status(&TaskId::from("ghost"), TaskStatus::Running)
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
    }

    #[test]
    fn test_stats_and_terminal_cleanup() {
        let queue = TaskQueue::new();
        queue.add_task(task("done", TaskPriority::Normal)).unwrap();
        queue.add_task(task("gone", TaskPriority::Normal)).unwrap();
        queue.add_task(task("wait", TaskPriority::Normal)).unwrap();
        queue
            .update_task_status(&TaskId::from("done"), TaskStatus::Completed)
            .unwrap();
        queue
            .update_task_status(&TaskId::from("gone"), TaskStatus::Cancelled)
            .unwrap();

        let stats = queue.get_stats();
        assert_eq!(
            stats,
            TaskStats {
                total: 3,
                pending: 1,
                completed: 1,
                cancelled: 1,
                ..Default::default()
            }
        );
        assert!(queue.get_task(&TaskId::from("done")).unwrap().completed_at.is_some());

        assert_eq!(queue.remove_terminal(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(drain(&queue), vec!["wait"]);
    }
}
