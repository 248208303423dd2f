//! Fixed-size worker pool.
//!
//! Workers drain a FIFO of boxed closures under one mutex and sleep on a
//! condvar when it runs dry. Threads are detached at construction; dropping
//! the pool flips the closed flag and broadcasts, letting every worker exit
//! once the queue is empty. The pool is the last thing the server drops, so
//! no task outlives the state it borrows through its captured `Arc`s.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

/// Fixed set of worker threads consuming submitted closures in FIFO order.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish()
    }
}

impl WorkerPool {
    /// Spawns `thread_num` detached workers. `thread_num` must be positive.
    pub fn new(thread_num: usize) -> Self {
        assert!(thread_num > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        for id in 0..thread_num {
            let shared = Arc::clone(&shared);
            let builder = thread::Builder::new().name(format!("worker-{id}"));
            let spawned = builder.spawn(move || {
                let mut state = shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        drop(state);
                        task();
                        state = shared
                            .state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                    } else if state.closed {
                        break;
                    } else {
                        state = shared
                            .available
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            });
            if let Err(err) = spawned {
                tracing::error!("failed to spawn worker thread: {err}");
            }
        }

        Self { shared }
    }

    /// Appends `task` to the queue and wakes one worker.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
        }
        self.shared.available.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use super::WorkerPool;

    #[test]
    fn submitted_tasks_all_run() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }

        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(100, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn tasks_submitted_before_drop_still_complete() {
        let (tx, rx) = mpsc::channel();
        {
            let pool = WorkerPool::new(1);
            for i in 0..10 {
                let tx = tx.clone();
                pool.submit(move || tx.send(i).unwrap());
            }
            // drop broadcasts close; the single worker drains the queue first
        }
        let mut seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!((0..10).collect::<Vec<_>>(), seen);
    }

    #[test]
    fn single_worker_runs_tasks_in_submission_order() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap());
        }
        let seen: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!((0..20).collect::<Vec<_>>(), seen);
    }
}
