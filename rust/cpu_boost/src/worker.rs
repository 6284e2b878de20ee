// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: per-CPU migration sync worker
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One worker thread per CPU, bound to it, turning migration requests into a
//! synchronized frequency floor for that CPU.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Serialize;

use crate::affinity;
use crate::engine::Shared;
use crate::policy::PolicySnapshot;
use crate::policy::ThermalAdvisor;
use crate::CpuId;
use crate::Khz;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WorkerState {
    Waiting = 0,
    Processing = 1,
    Stopped = 2,
}

impl WorkerState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Waiting,
            1 => WorkerState::Processing,
            _ => WorkerState::Stopped,
        }
    }
}

/// Frequency `dest` should be raised to after a task carrying `task_load`
/// percent of load arrived from `src`, or None if no boost is warranted.
pub(crate) fn sync_target(
    dest: &PolicySnapshot,
    src: &PolicySnapshot,
    task_load: u32,
    sync_threshold: Khz,
    sync_threshold_min: Khz,
    thermal: &dyn ThermalAdvisor,
) -> Option<Khz> {
    let load_freq = (dest.max as u64 * task_load.min(100) as u64 / 100) as Khz;
    let mut req = load_freq.max(src.cur);

    if sync_threshold != 0 {
        req = req.min(sync_threshold);
    }
    req = thermal.clamp(req);

    if req <= dest.cpuinfo_min {
        return None;
    }
    if sync_threshold_min != 0 && req < sync_threshold_min {
        return None;
    }
    Some(req)
}

/// Worker body for `cpu`. Returns when the engine stops.
pub(crate) fn run(shared: Arc<Shared>, cpu: CpuId) {
    let s = &shared.cpus[cpu];
    s.worker.bind_current(affinity::current_tid());
    if let Err(e) = affinity::pin_current_thread(cpu) {
        debug!("boost_sync/{}: {:#}", cpu, e);
    }

    loop {
        s.set_state(WorkerState::Waiting);
        let Some(req) = s.wait_request() else {
            break;
        };
        s.set_state(WorkerState::Processing);
        shared.sync_cpus(cpu, req.src_cpu, req.task_load);
    }

    s.set_state(WorkerState::Stopped);
    debug!("boost_sync/{} stopped", cpu);
}

impl Shared {
    /// One processing cycle of `dest`'s worker.
    pub(crate) fn sync_cpus(self: &Arc<Self>, dest: CpuId, src: CpuId, task_load: u32) {
        let (src_policy, dest_policy) = match (self.policy.policy(src), self.policy.policy(dest)) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => {
                debug!("CPU{}: no policy for sync from CPU{}: {:#}", dest, src, e);
                self.stats.query_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(req) = sync_target(
            &dest_policy,
            &src_policy,
            task_load,
            self.tunables.sync_threshold(),
            self.tunables.sync_threshold_min(),
            &*self.thermal,
        ) else {
            self.stats.sync_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let slot = &self.cpus[dest].migration;
        let gen = slot.set(req, &self.timers);
        self.stats.sync_boosts.fetch_add(1, Ordering::Relaxed);
        debug!("CPU{} --> CPU{}: sync boost {} kHz", src, dest, req);

        // Let the source's governor know a sync happened even though its own
        // limits do not change.
        if self.policy.cpu_online(src) {
            self.policy.update_policy(src);
        }

        if self.policy.cpu_online(dest) {
            self.policy.update_policy(dest);
            self.arm_migration_expiry(dest, gen);
        } else {
            slot.reset(&self.timers);
        }
    }

    fn arm_migration_expiry(self: &Arc<Self>, cpu: CpuId, gen: u64) {
        let delay = Duration::from_millis(self.tunables.boost_ms() as u64);
        let weak = Arc::downgrade(self);
        self.cpus[cpu].migration.arm(gen, || {
            self.timers.schedule_on(
                cpu,
                delay,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.remove_migration_boost(cpu, gen);
                    }
                }),
            )
        });
    }

    pub(crate) fn remove_migration_boost(&self, cpu: CpuId, gen: u64) {
        if !self.cpus[cpu].migration.expire(gen) {
            return;
        }
        debug!("Removing boost for CPU{}", cpu);
        self.stats.expiries.fetch_add(1, Ordering::Relaxed);
        if self.policy.cpu_online(cpu) {
            self.policy.update_policy(cpu);
        }
    }
}
