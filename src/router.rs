//! In-process hand-off between the fetch loop, the workers and the flush loop.
//!
//! Two FIFOs, each behind its own lock: `todo` (fetched, waiting for a worker)
//! and `finished` (executed, waiting to be flushed). No operation ever holds
//! both locks, and none of them blocks waiting for items.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{trace, Span};

use crate::types::ScanTask;

#[derive(Debug)]
pub struct TaskRouter<T = ScanTask> {
    todo: Mutex<VecDeque<T>>,
    finished: Mutex<VecDeque<T>>,
    span: Span,
}

impl<T> Default for TaskRouter<T> {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

fn locked<T>(m: &Mutex<VecDeque<T>>) -> MutexGuard<'_, VecDeque<T>> {
    // a panicking holder cannot leave a VecDeque half-updated
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T> TaskRouter<T> {
    pub fn new(span: Span) -> Self {
        Self {
            todo: Mutex::new(VecDeque::new()),
            finished: Mutex::new(VecDeque::new()),
            span,
        }
    }

    pub fn add_todo(&self, task: T) {
        let _e = self.span.enter();
        trace!("add_todo");
        locked(&self.todo).push_back(task);
    }

    pub fn add_todo_batch(&self, tasks: impl IntoIterator<Item = T>) {
        let _e = self.span.enter();
        let mut todo = locked(&self.todo);
        let before = todo.len();
        todo.extend(tasks);
        trace!(added = todo.len() - before, "add_todo_batch");
    }

    /// Pop the oldest pending task, or `None` right away if there is none.
    pub fn get_todo(&self) -> Option<T> {
        locked(&self.todo).pop_front()
    }

    pub fn todo_count(&self) -> usize {
        locked(&self.todo).len()
    }

    pub fn add_finished(&self, task: T) {
        let _e = self.span.enter();
        trace!("add_finished");
        locked(&self.finished).push_back(task);
    }

    /// Take everything currently finished. Concurrent callers each get a disjoint share.
    pub fn drain_finished(&self) -> Vec<T> {
        let drained: Vec<T> = locked(&self.finished).drain(..).collect();
        if !drained.is_empty() {
            let _e = self.span.enter();
            trace!(count = drained.len(), "drain_finished");
        }
        drained
    }

    pub fn finished_count(&self) -> usize {
        locked(&self.finished).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn todo_is_fifo() {
        let r = TaskRouter::<i32>::default();
        r.add_todo(1);
        r.add_todo_batch([2, 3]);
        assert_eq!(r.todo_count(), 3);
        assert_eq!(r.get_todo(), Some(1));
        assert_eq!(r.get_todo(), Some(2));
        assert_eq!(r.get_todo(), Some(3));
        assert_eq!(r.get_todo(), None);
    }

    #[test]
    fn drain_empties_finished() {
        let r = TaskRouter::<&str>::default();
        r.add_finished("a");
        r.add_finished("b");
        assert_eq!(r.finished_count(), 2);
        assert_eq!(r.drain_finished(), vec!["a", "b"]);
        assert_eq!(r.finished_count(), 0);
        assert!(r.drain_finished().is_empty());
    }

    #[test]
    fn queues_are_independent() {
        let r = TaskRouter::<i32>::default();
        r.add_todo(1);
        r.add_finished(2);
        assert_eq!(r.drain_finished(), vec![2]);
        assert_eq!(r.todo_count(), 1);
    }

    #[test]
    fn concurrent_drains_partition() {
        let r = Arc::new(TaskRouter::<i32>::default());
        for i in 0..10_000 {
            r.add_finished(i);
        }
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..100 {
                        got.extend(r.drain_finished());
                    }
                    got
                })
            })
            .collect();
        let parts: Vec<Vec<i32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let a: HashSet<_> = parts[0].iter().copied().collect();
        let b: HashSet<_> = parts[1].iter().copied().collect();
        assert!(a.is_disjoint(&b));
        assert_eq!(a.len() + b.len(), 10_000);
        assert_eq!(r.finished_count(), 0);
    }
}
