// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: policy adjust hook
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use log::debug;

use crate::affinity;
use crate::engine::Shared;
use crate::policy::FloorRequest;
use crate::policy::PolicyLimits;
use crate::policy::PolicyNotifier;
use crate::CpuId;
use crate::Khz;
use crate::FREQ_MAX;

/// Floor to request for a policy about to be committed, given the CPU's
/// migration floor `sync_min` and input floor `input_min`.
pub(crate) fn boost_floor(
    limits: &PolicyLimits,
    sync_min: Khz,
    input_min: Khz,
) -> Option<FloorRequest> {
    if sync_min == 0 && input_min == 0 {
        return None;
    }

    let input_min = if input_min == FREQ_MAX {
        limits.max
    } else {
        input_min.min(limits.max)
    };
    // an input floor the policy already meets needs no clamp
    if input_min != 0 && input_min <= limits.min {
        return None;
    }
    let min = sync_min.max(input_min).min(limits.max);

    if min == 0 || min <= limits.min {
        return None;
    }
    Some(FloorRequest { min })
}

impl PolicyNotifier for Shared {
    fn adjust(&self, limits: &PolicyLimits) -> Option<FloorRequest> {
        let s = self.cpu(limits.cpu)?;
        let req = boost_floor(limits, s.migration.floor(), s.input.floor())?;
        debug!(
            "CPU{}: adjusting min {} -> {} kHz",
            limits.cpu, limits.min, req.min
        );
        Some(req)
    }

    fn core_started(&self, cpu: CpuId) {
        let Some(tid) = self.cpu(cpu).and_then(|s| s.worker.tid()) else {
            return;
        };
        if let Err(e) = affinity::pin_thread(tid, cpu) {
            debug!("boost_sync/{}: {:#}", cpu, e);
        }
    }

    fn core_stopped(&self, cpu: CpuId) {
        if let Some(s) = self.cpu(cpu) {
            s.reset(&self.timers);
            debug!("CPU{}: offline, boost dropped", cpu);
        }
    }
}
