//! Background task primitives.

use futures::Future;
use std::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

/// Slot holding at most one cancelable background task.
///
/// An empty slot behaves like a task that has already finished: cancel is a
/// no-op and the slot reports done. Storing a new task cancels the previous
/// one.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    handle: Mutex<Option<AbortHandle>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self { handle: Mutex::new(None) }
    }

    /// Stores the task, canceling any previously stored one.
    pub fn set(&self, task: JoinHandle<()>) {
        let mut handle = self.handle.lock().unwrap();
        if let Some(prev) = handle.replace(task.abort_handle()) {
            prev.abort();
        }
    }

    /// Stores an abort handle, canceling any previously stored task.
    pub fn set_abort(&self, abort: AbortHandle) {
        let mut handle = self.handle.lock().unwrap();
        if let Some(prev) = handle.replace(abort) {
            prev.abort();
        }
    }

    /// Cancels the stored task, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Whether the stored task has finished or no task is stored.
    pub fn is_done(&self) -> bool {
        self.handle.lock().unwrap().as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Supervised set of fire-and-forget tasks.
///
/// Scheduled side effects that no caller awaits (e.g. propagating a property
/// write to every adapter) are collected here instead of being detached, so
/// they can be aborted collectively at shutdown.
pub(crate) struct TaskSet {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self { tasks: Mutex::new(JoinSet::new()) }
    }

    /// Spawns a task into the set, reaping already finished ones.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock().unwrap();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    /// Aborts all tasks in the set.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.abort_all();
        while tasks.try_join_next().is_some() {}
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_slot_is_done() {
        let slot = TaskSlot::new();
        assert!(slot.is_done());
        slot.cancel();
        assert!(slot.is_done());
    }

    #[tokio::test]
    async fn slot_replaces_and_cancels() {
        let slot = TaskSlot::new();
        slot.set(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }));
        assert!(!slot.is_done());
        slot.set(tokio::spawn(async {}));
        slot.cancel();
        tokio::task::yield_now().await;
        assert!(slot.is_done());
    }
}
