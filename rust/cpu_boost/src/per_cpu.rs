// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: per-CPU boost state
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::thread::ThreadId;

use crate::expiry::ExpiryScheduler;
use crate::expiry::TaskId;
use crate::lock;
use crate::worker::WorkerState;
use crate::CpuId;
use crate::Khz;

/// Latest unconsumed migration towards a CPU. Guarded by `PerCpuSync::request`.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SyncRequest {
    pub pending: bool,
    pub src_cpu: CpuId,
    pub task_load: u32,
    pub stop: bool,
}

#[derive(Debug, Default)]
struct SlotTimer {
    generation: u64,
    task: Option<TaskId>,
}

/// A frequency floor with its own expiry.
///
/// Every `set` or `reset` starts a new generation and cancels the pending
/// expiry. An expiry only clears the floor if it still belongs to the current
/// generation, so an expiry that already started running when it was
/// cancelled cannot wipe a newer boost.
#[derive(Debug, Default)]
pub(crate) struct BoostSlot {
    floor: AtomicU32,
    timer: Mutex<SlotTimer>,
}

impl BoostSlot {
    pub fn floor(&self) -> Khz {
        self.floor.load(Ordering::Acquire)
    }

    /// Install `floor` and return its generation.
    pub fn set(&self, floor: Khz, timers: &ExpiryScheduler) -> u64 {
        let mut t = lock(&self.timer);
        t.generation += 1;
        if let Some(id) = t.task.take() {
            timers.cancel(id);
        }
        self.floor.store(floor, Ordering::Release);
        t.generation
    }

    /// Arm the expiry of generation `gen` with the task id returned by
    /// `schedule`. Does nothing if a newer generation exists.
    pub fn arm(&self, gen: u64, schedule: impl FnOnce() -> TaskId) -> bool {
        let mut t = lock(&self.timer);
        if t.generation != gen {
            return false;
        }
        t.task = Some(schedule());
        true
    }

    /// Clear the floor of generation `gen`. Returns true if it was cleared.
    pub fn expire(&self, gen: u64) -> bool {
        let mut t = lock(&self.timer);
        if t.generation != gen {
            return false;
        }
        t.generation += 1;
        t.task = None;
        self.floor.store(0, Ordering::Release);
        true
    }

    /// Drop the floor and any pending expiry.
    pub fn reset(&self, timers: &ExpiryScheduler) {
        let mut t = lock(&self.timer);
        t.generation += 1;
        if let Some(id) = t.task.take() {
            timers.cancel(id);
        }
        self.floor.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub fn pending_expiry(&self) -> Option<TaskId> {
        lock(&self.timer).task
    }
}

/// Identity of the sync worker bound to a CPU.
#[derive(Debug, Default)]
pub(crate) struct WorkerIdentity {
    thread: OnceLock<ThreadId>,
    tid: AtomicI32,
}

impl WorkerIdentity {
    /// Record the calling thread as the worker.
    pub fn bind_current(&self, tid: i32) {
        let _ = self.thread.set(std::thread::current().id());
        self.tid.store(tid, Ordering::Release);
    }

    pub fn is_current(&self) -> bool {
        self.thread.get() == Some(&std::thread::current().id())
    }

    /// Kernel thread id, or None before the worker started.
    pub fn tid(&self) -> Option<i32> {
        match self.tid.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }
}

pub(crate) struct PerCpuSync {
    pub cpu: CpuId,
    pub request: Mutex<SyncRequest>,
    pub wake: Condvar,
    /// Set while a waker is signalling `wake`.
    pub being_woken: AtomicBool,
    pub migration: BoostSlot,
    pub input: BoostSlot,
    pub worker: WorkerIdentity,
    state: AtomicU8,
}

impl PerCpuSync {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            request: Mutex::new(SyncRequest::default()),
            wake: Condvar::new(),
            being_woken: AtomicBool::new(false),
            migration: BoostSlot::default(),
            input: BoostSlot::default(),
            worker: WorkerIdentity::default(),
            state: AtomicU8::new(WorkerState::Waiting as u8),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn pending(&self) -> bool {
        lock(&self.request).pending
    }

    /// Record a migration. Returns true if it replaced an unconsumed one.
    pub fn post(&self, src_cpu: CpuId, task_load: u32) -> bool {
        let mut req = lock(&self.request);
        let coalesced = req.pending;
        req.pending = true;
        req.src_cpu = src_cpu;
        req.task_load = task_load;
        coalesced
    }

    /// Wake the worker unless another waker is already doing it.
    pub fn kick(&self) -> bool {
        if self
            .being_woken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.wake.notify_one();
        self.being_woken.store(false, Ordering::Release);
        true
    }

    /// Block until a migration is pending or the worker must stop. Returns
    /// the consumed request, or None on stop.
    pub fn wait_request(&self) -> Option<SyncRequest> {
        let mut req = lock(&self.request);
        while !req.pending && !req.stop {
            req = self.wake.wait(req).unwrap_or_else(|e| e.into_inner());
        }
        if req.stop {
            return None;
        }
        req.pending = false;
        Some(*req)
    }

    pub fn request_stop(&self) {
        lock(&self.request).stop = true;
        self.wake.notify_all();
    }

    /// Reset to idle: no pending request, both floors dropped.
    pub fn reset(&self, timers: &ExpiryScheduler) {
        lock(&self.request).pending = false;
        self.migration.reset(timers);
        self.input.reset(timers);
    }
}
