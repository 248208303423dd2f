//! Deadline tracking for idle-connection reaping.
//!
//! An indexed binary min-heap keyed by monotonic expiry, with an fd →
//! position map maintained across every swap so any entry can be adjusted or
//! removed in `O(log n)`. The root's remaining time doubles as the reactor's
//! poll timeout. Expired nodes are detached from the heap *before* their
//! callback runs, so a callback may freely operate on connections without
//! re-entering the heap.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

type TimeoutCallback = Box<dyn FnOnce()>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: TimeoutCallback,
}

/// Min-heap of per-connection deadlines, keyed by fd.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    position: HashMap<RawFd, usize>,
}

impl std::fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap").field("len", &self.heap.len()).finish()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            position: HashMap::new(),
        }
    }

    /// Number of tracked deadlines.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no deadlines are tracked.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedules `id` to expire after `timeout`, running `cb` when it does.
    ///
    /// A known `id` has its deadline and callback replaced and is re-sifted
    /// in place.
    pub fn add<F>(&mut self, id: RawFd, timeout: Duration, cb: F)
    where
        F: FnOnce() + 'static,
    {
        let expires = Instant::now() + timeout;
        match self.position.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.position.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Box::new(cb),
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = Box::new(cb);
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Pushes the deadline of a known `id` further out, keeping its callback.
    /// Extend-only, so a sift-down suffices.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        if let Some(i) = self.position.get(&id).copied() {
            self.heap[i].expires = Instant::now() + timeout;
            self.sift_down(i, self.heap.len());
        }
    }

    /// Drops the deadline for `id`, if tracked, without running its callback.
    pub fn remove(&mut self, id: RawFd) {
        if let Some(i) = self.position.get(&id).copied() {
            self.delete(i);
        }
    }

    /// Runs the callback for `id` immediately and drops its deadline.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(i) = self.position.get(&id).copied() {
            let node = self.take(i);
            (node.cb)();
        }
    }

    /// Runs and removes every expired deadline.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.take(0);
            (node.cb)();
        }
    }

    /// Expires due deadlines, then reports the time until the next one.
    ///
    /// `Some(0)` means the root is already due again; `None` means the heap
    /// is empty and the caller may block indefinitely.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        let root = self.heap.first()?;
        Some(root.expires.saturating_duration_since(Instant::now()))
    }

    /// Removes the node at `i` and returns it, restoring the heap property.
    fn take(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        self.swap_nodes(i, last);
        let node = self.heap.pop().expect("heap is non-empty");
        self.position.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
        node
    }

    fn delete(&mut self, i: usize) {
        drop(self.take(i));
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Sinks the node at `index` below `n`; true when it moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.position.insert(self.heap[i].id, i);
        self.position.insert(self.heap[j].id, j);
    }
}
