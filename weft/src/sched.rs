//! Ready-queue disciplines.
//!
//! A cluster dispatches from one [`ReadyQueue`]. The default is FIFO; a
//! custom discipline can be supplied at cluster construction as long as it
//! honors the contract that `pop` returns tasks in dispatch order.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::task::TaskCore;

pub trait ReadyQueue: Send {
    fn push(&mut self, task: Arc<TaskCore>);
    fn pop(&mut self) -> Option<Arc<TaskCore>>;
    /// Remove a specific task, wherever it is queued. Returns whether it was
    /// found.
    fn remove(&mut self, task: &Arc<TaskCore>) -> bool;
    /// Re-insert a queued task after a scheduling-attribute change.
    fn requeue(&mut self, task: &Arc<TaskCore>) {
        if self.remove(task) {
            self.push(task.clone());
        }
    }
    /// Move everything into `other`, preserving dispatch order.
    fn transfer_all(&mut self, other: &mut dyn ReadyQueue) {
        while let Some(t) = self.pop() {
            other.push(t);
        }
    }
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First-in first-out dispatch, ordered by enqueue time.
pub struct FifoQueue {
    queue: VecDeque<Arc<TaskCore>>,
}

impl FifoQueue {
    pub fn new() -> Self {
        FifoQueue {
            queue: VecDeque::new(),
        }
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue for FifoQueue {
    fn push(&mut self, task: Arc<TaskCore>) {
        self.queue.push_back(task);
    }

    fn pop(&mut self) -> Option<Arc<TaskCore>> {
        self.queue.pop_front()
    }

    fn remove(&mut self, task: &Arc<TaskCore>) -> bool {
        if let Some(at) = self.queue.iter().position(|t| Arc::ptr_eq(t, task)) {
            self.queue.remove(at);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}
