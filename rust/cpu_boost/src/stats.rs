// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: boost statistics
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Live counters, bumped from the boost paths with relaxed atomics.
#[derive(Debug, Default)]
pub(crate) struct BoostStats {
    pub migrations: AtomicU64,
    pub migrations_filtered: AtomicU64,
    pub migrations_coalesced: AtomicU64,
    pub self_wake_skipped: AtomicU64,
    pub wakeups: AtomicU64,
    pub sync_boosts: AtomicU64,
    pub sync_discarded: AtomicU64,
    pub query_failures: AtomicU64,
    pub input_events: AtomicU64,
    pub input_debounced: AtomicU64,
    pub input_passes: AtomicU64,
    pub input_boosts: AtomicU64,
    pub app_launches: AtomicU64,
    pub expiries: AtomicU64,
}

impl BoostStats {
    pub fn metrics(&self) -> Metrics {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Metrics {
            migrations: get(&self.migrations),
            migrations_filtered: get(&self.migrations_filtered),
            migrations_coalesced: get(&self.migrations_coalesced),
            self_wake_skipped: get(&self.self_wake_skipped),
            wakeups: get(&self.wakeups),
            sync_boosts: get(&self.sync_boosts),
            sync_discarded: get(&self.sync_discarded),
            query_failures: get(&self.query_failures),
            input_events: get(&self.input_events),
            input_debounced: get(&self.input_debounced),
            input_passes: get(&self.input_passes),
            input_boosts: get(&self.input_boosts),
            app_launches: get(&self.app_launches),
            expiries: get(&self.expiries),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Migration notifications received
    pub migrations: u64,
    /// Migrations dropped by the load threshold
    pub migrations_filtered: u64,
    /// Migrations that replaced an unconsumed one
    pub migrations_coalesced: u64,
    /// Migrations of a sync worker onto its own CPU
    pub self_wake_skipped: u64,
    /// Worker wakeups issued
    pub wakeups: u64,
    /// Sync floors applied
    pub sync_boosts: u64,
    /// Sync cycles that needed no boost
    pub sync_discarded: u64,
    /// Failed policy queries
    pub query_failures: u64,
    /// Input events received
    pub input_events: u64,
    /// Input events dropped by the debounce window
    pub input_debounced: u64,
    /// Input boost passes run
    pub input_passes: u64,
    /// Per-CPU input floors applied
    pub input_boosts: u64,
    /// App launch boosts
    pub app_launches: u64,
    /// Boost floors removed by expiry
    pub expiries: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[cpu_boost] mig {:>6} filt {:>6} coal {:>5} self {:>3} | sync {:>6} skip {:>6} qerr {:>3} | \
             input {:>6} deb {:>6} pass {:>5} boost {:>6} | app {:>3} exp {:>6}",
            self.migrations,
            self.migrations_filtered,
            self.migrations_coalesced,
            self.self_wake_skipped,
            self.sync_boosts,
            self.sync_discarded,
            self.query_failures,
            self.input_events,
            self.input_debounced,
            self.input_passes,
            self.input_boosts,
            self.app_launches,
            self.expiries,
        )?;
        Ok(())
    }

    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            migrations: self.migrations.saturating_sub(prev.migrations),
            migrations_filtered: self.migrations_filtered.saturating_sub(prev.migrations_filtered),
            migrations_coalesced: self
                .migrations_coalesced
                .saturating_sub(prev.migrations_coalesced),
            self_wake_skipped: self.self_wake_skipped.saturating_sub(prev.self_wake_skipped),
            wakeups: self.wakeups.saturating_sub(prev.wakeups),
            sync_boosts: self.sync_boosts.saturating_sub(prev.sync_boosts),
            sync_discarded: self.sync_discarded.saturating_sub(prev.sync_discarded),
            query_failures: self.query_failures.saturating_sub(prev.query_failures),
            input_events: self.input_events.saturating_sub(prev.input_events),
            input_debounced: self.input_debounced.saturating_sub(prev.input_debounced),
            input_passes: self.input_passes.saturating_sub(prev.input_passes),
            input_boosts: self.input_boosts.saturating_sub(prev.input_boosts),
            app_launches: self.app_launches.saturating_sub(prev.app_launches),
            expiries: self.expiries.saturating_sub(prev.expiries),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
