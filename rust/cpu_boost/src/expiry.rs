// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: deferred task scheduler
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A single high-priority thread running delayed tasks.
//!
//! Boost expiries, the input boost pass and thermal polling all run here. Tasks
//! execute one at a time in deadline order. Cancelling never waits for a task
//! that is already running; callers that race with a running task must detect
//! staleness themselves (see `BoostSlot`).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;

use crate::affinity;
use crate::lock;
use crate::CpuId;

/// Handle of a scheduled task, usable to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    cpu: Option<CpuId>,
    task: Task,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Pending>,
    next_id: u64,
    stop: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the deferred task thread.
#[derive(Clone)]
pub struct ExpiryScheduler {
    inner: Arc<Inner>,
}

impl ExpiryScheduler {
    /// Spawn the task thread. `name` becomes the thread name.
    pub fn start(name: &str) -> Result<Self> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        });

        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                affinity::raise_current_thread_priority();
                run(&thread_inner);
            })
            .with_context(|| format!("failed to spawn {} thread", name))?;
        *lock(&inner.thread) = Some(handle);

        Ok(Self { inner })
    }

    /// Run `task` as soon as possible.
    pub fn queue(&self, task: Task) -> TaskId {
        self.insert(None, Duration::ZERO, task)
    }

    /// Run `task` after `delay`.
    pub fn schedule(&self, delay: Duration, task: Task) -> TaskId {
        self.insert(None, delay, task)
    }

    /// Run `task` after `delay`, tagged with `cpu` for diagnostics. The task
    /// still runs on the scheduler thread.
    pub fn schedule_on(&self, cpu: CpuId, delay: Duration, task: Task) -> TaskId {
        self.insert(Some(cpu), delay, task)
    }

    fn insert(&self, cpu: Option<CpuId>, delay: Duration, task: Task) -> TaskId {
        let mut q = lock(&self.inner.queue);
        let id = q.next_id;
        q.next_id += 1;
        if q.stop {
            debug!("expiry scheduler stopped, dropping task {}", id);
            return TaskId(id);
        }
        q.heap.push(Reverse((Instant::now() + delay, id)));
        q.tasks.insert(id, Pending { cpu, task });
        drop(q);
        self.inner.cond.notify_one();
        TaskId(id)
    }

    /// Remove a task that has not started yet. Returns false if it already ran,
    /// is running, or was cancelled before.
    pub fn cancel(&self, id: TaskId) -> bool {
        lock(&self.inner.queue).tasks.remove(&id.0).is_some()
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        lock(&self.inner.queue).tasks.contains_key(&id.0)
    }

    pub fn nr_pending(&self) -> usize {
        lock(&self.inner.queue).tasks.len()
    }

    /// Drop all pending tasks and join the thread. Idempotent.
    pub fn stop(&self) {
        let dropped = {
            let mut q = lock(&self.inner.queue);
            q.stop = true;
            q.heap.clear();
            std::mem::take(&mut q.tasks)
        };
        self.inner.cond.notify_all();
        // outside the queue lock
        drop(dropped);

        let handle = lock(&self.inner.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("expiry thread panicked");
            }
        }
    }
}

fn run(inner: &Inner) {
    let mut q = lock(&inner.queue);
    loop {
        if q.stop {
            break;
        }

        let Some(&Reverse((deadline, id))) = q.heap.peek() else {
            q = inner.cond.wait(q).unwrap_or_else(|e| e.into_inner());
            continue;
        };

        if !q.tasks.contains_key(&id) {
            // cancelled
            q.heap.pop();
            continue;
        }

        let now = Instant::now();
        if deadline > now {
            q = inner
                .cond
                .wait_timeout(q, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            continue;
        }

        q.heap.pop();
        let Some(pending) = q.tasks.remove(&id) else {
            continue;
        };
        drop(q);

        if std::panic::catch_unwind(AssertUnwindSafe(pending.task)).is_err() {
            match pending.cpu {
                Some(cpu) => error!("deferred task {} for CPU{} panicked", id, cpu),
                None => error!("deferred task {} panicked", id),
            }
        }

        q = lock(&inner.queue);
    }
}
