// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: CPU frequency boost synchronization engine
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Temporarily raises the minimum frequency of CPUs in response to task
//! migrations, user input and application launches, and drops the boost again
//! after a configurable timeout.
//!
//! The engine does not enforce frequencies itself. It is plugged into a
//! [`PolicyLayer`] that owns the per-CPU frequency policies: the engine asks the
//! layer to re-evaluate a CPU whenever a floor changes, and the layer calls back
//! into [`PolicyNotifier::adjust`] to learn which floor to apply.

mod affinity;
pub mod config;
mod engine;
mod expiry;
mod input;
mod migration;
mod notifier;
mod per_cpu;
pub mod policy;
pub mod stats;
pub mod thermal;
mod worker;

#[cfg(test)]
mod testutil;

pub use config::BoostConfig;
pub use config::Tunables;
pub use engine::BoostEngine;
pub use engine::CpuBoostState;
pub use expiry::ExpiryScheduler;
pub use expiry::TaskId;
pub use policy::FloorRequest;
pub use policy::MigrationNotifier;
pub use policy::NoThermal;
pub use policy::PolicyLayer;
pub use policy::PolicyLimits;
pub use policy::PolicyNotifier;
pub use policy::PolicySnapshot;
pub use policy::ThermalAdvisor;
pub use stats::Metrics;
pub use worker::WorkerState;

/// Logical CPU index.
pub type CpuId = usize;

/// Frequency in kHz, as reported by cpufreq.
pub type Khz = u32;

/// Input floor sentinel meaning "boost to this CPU's own policy maximum".
pub const FREQ_MAX: Khz = u32::MAX;

/// Input events closer together than this are accounted as one.
pub const MIN_INPUT_INTERVAL_US: u64 = 150 * 1000;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
