// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: interfaces to the frequency policy layer and its neighbours
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Result;
use serde::Serialize;

use crate::CpuId;
use crate::Khz;

/// Read-only view of one CPU's frequency policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolicySnapshot {
    pub cpu: CpuId,
    pub min: Khz,
    pub max: Khz,
    pub cur: Khz,
    /// Utilization of the CPU in percent (0-100).
    pub util: u32,
    /// Hardware floor of the CPU.
    pub cpuinfo_min: Khz,
    /// Hardware ceiling of the CPU.
    pub cpuinfo_max: Khz,
}

/// Limits of a policy update that is being assembled by the policy layer.
///
/// Notifiers look at these before the layer commits them. Changes are made
/// through [`PolicyLimits::verify_within_limits`] so min never ends up above max.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyLimits {
    pub cpu: CpuId,
    pub min: Khz,
    pub max: Khz,
    pub cpuinfo_min: Khz,
    pub cpuinfo_max: Khz,
}

impl PolicyLimits {
    pub fn from_snapshot(policy: &PolicySnapshot) -> Self {
        Self {
            cpu: policy.cpu,
            min: policy.min,
            max: policy.max,
            cpuinfo_min: policy.cpuinfo_min,
            cpuinfo_max: policy.cpuinfo_max,
        }
    }

    /// Squeeze the policy into `[min, max]`.
    pub fn verify_within_limits(&mut self, min: Khz, max: Khz) {
        self.max = self.max.clamp(min, max.max(min));
        self.min = self.min.clamp(min, self.max);
    }

    /// Raise the policy minimum as requested, leaving the maximum alone.
    pub fn apply(&mut self, req: FloorRequest) {
        self.verify_within_limits(req.min, Khz::MAX);
    }

    /// Run one notifier over these limits and apply what it asks for.
    pub fn notify(&mut self, notifier: &dyn PolicyNotifier) {
        if let Some(req) = notifier.adjust(self) {
            self.apply(req);
        }
    }
}

/// Minimum frequency a notifier wants the policy raised to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloorRequest {
    pub min: Khz,
}

/// The frequency policy enforcement layer.
///
/// `update_policy` must call every registered [`PolicyNotifier::adjust`] before
/// committing new limits.
pub trait PolicyLayer: Send + Sync {
    /// Current policy of `cpu`. Errors are transient: callers skip the cycle.
    fn policy(&self, cpu: CpuId) -> Result<PolicySnapshot>;

    /// Force a re-evaluation of `cpu`'s policy.
    fn update_policy(&self, cpu: CpuId);

    fn cpu_online(&self, cpu: CpuId) -> bool;

    fn online_cpus(&self) -> Vec<CpuId>;
}

/// Callbacks invoked by the policy layer.
///
/// Both run synchronously in the policy layer's context and must not block.
pub trait PolicyNotifier: Send + Sync {
    /// A policy for `policy.cpu` is about to be committed.
    fn adjust(&self, policy: &PolicyLimits) -> Option<FloorRequest>;

    /// `cpu` just came online.
    fn core_started(&self, _cpu: CpuId) {}

    /// `cpu` went offline. Boost state kept for it is dropped.
    fn core_stopped(&self, _cpu: CpuId) {}
}

/// Scheduler task-migration callback.
pub trait MigrationNotifier: Send + Sync {
    /// A runnable task moved from `src` to `dest`. Never blocks.
    fn task_migrated(&self, src: CpuId, dest: CpuId);
}

/// Thermal limits consulted before requesting a floor.
pub trait ThermalAdvisor: Send + Sync {
    fn throttling(&self) -> bool;

    fn limited_max_freq(&self) -> Khz;

    /// Cap `freq` to the advised maximum while throttling.
    fn clamp(&self, freq: Khz) -> Khz {
        if self.throttling() {
            freq.min(self.limited_max_freq())
        } else {
            freq
        }
    }
}

/// Advisor for platforms without thermal throttling.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoThermal;

impl ThermalAdvisor for NoThermal {
    fn throttling(&self) -> bool {
        false
    }

    fn limited_max_freq(&self) -> Khz {
        Khz::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min: Khz, max: Khz) -> PolicyLimits {
        PolicyLimits {
            cpu: 0,
            min,
            max,
            cpuinfo_min: 300_000,
            cpuinfo_max: 2_000_000,
        }
    }

    #[test]
    fn apply_raises_min_only() {
        let mut l = limits(300_000, 1_500_000);
        l.apply(FloorRequest { min: 1_000_000 });
        assert_eq!(l.min, 1_000_000);
        assert_eq!(l.max, 1_500_000);
    }

    #[test]
    fn apply_never_lowers_min() {
        let mut l = limits(1_200_000, 1_500_000);
        l.apply(FloorRequest { min: 800_000 });
        assert_eq!(l.min, 1_200_000);
    }

    #[test]
    fn verify_caps_max() {
        let mut l = limits(300_000, 2_000_000);
        l.verify_within_limits(300_000, 1_036_800);
        assert_eq!(l.max, 1_036_800);
        assert!(l.min <= l.max);
    }

    #[test]
    fn thermal_clamp_only_when_throttling() {
        struct Hot(bool);
        impl ThermalAdvisor for Hot {
            fn throttling(&self) -> bool {
                self.0
            }
            fn limited_max_freq(&self) -> Khz {
                1_000_000
            }
        }
        assert_eq!(Hot(true).clamp(1_500_000), 1_000_000);
        assert_eq!(Hot(false).clamp(1_500_000), 1_500_000);
        assert_eq!(NoThermal.clamp(1_500_000), 1_500_000);
    }
}
