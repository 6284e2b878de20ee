// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: task migration notifications
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::Ordering;

use log::debug;
use log::warn;

use crate::engine::Shared;
use crate::policy::MigrationNotifier;
use crate::CpuId;

impl Shared {
    /// Hand a migration from `src` to `dest` over to `dest`'s sync worker.
    ///
    /// Runs in the scheduler's notification context: it only records the
    /// request and signals the worker, and every failure ends the event
    /// silently.
    pub(crate) fn on_task_migrated(&self, src: CpuId, dest: CpuId) {
        self.stats.migrations.fetch_add(1, Ordering::Relaxed);

        if self.events_disabled() || self.tunables.boost_ms() == 0 {
            return;
        }
        let Some(s) = self.cpus.get(dest) else {
            return;
        };

        let util = match self.policy.policy(src) {
            Ok(policy) => policy.util.min(100),
            Err(e) => {
                warn!("failed to get CPU{} policy: {:#}", src, e);
                self.stats.query_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let load_based = self.tunables.load_based_syncs();
        if load_based && util < self.tunables.migration_load_threshold() {
            self.stats.migrations_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The sync worker itself being moved onto its CPU must not wake it.
        if s.worker.is_current() {
            self.stats.self_wake_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        debug!("Migration: CPU{} --> CPU{}", src, dest);
        if s.post(src, if load_based { util } else { 0 }) {
            self.stats.migrations_coalesced.fetch_add(1, Ordering::Relaxed);
        }

        if s.kick() {
            self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl MigrationNotifier for Shared {
    fn task_migrated(&self, src: CpuId, dest: CpuId) {
        self.on_task_migrated(src, dest);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::testutil::wait_until;
    use crate::testutil::FakeSoc;
    use crate::BoostConfig;
    use crate::BoostEngine;

    fn engine(soc: &Arc<FakeSoc>, cfg: BoostConfig) -> BoostEngine {
        let engine = BoostEngine::start(&cfg, soc.nr_cpus(), soc.clone(), Arc::new(crate::NoThermal))
            .unwrap();
        soc.register(engine.notifier());
        engine
    }

    fn cfg() -> BoostConfig {
        BoostConfig {
            boost_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn light_source_load_is_discarded() {
        let soc = FakeSoc::new(4);
        soc.set_util(0, 20);
        let engine = engine(&soc, cfg());
        engine.on_task_migrated(0, 1);
        let state = engine.cpu_state(1).unwrap();
        assert!(!state.pending);
        assert_eq!(engine.metrics().migrations_filtered, 1);
        assert_eq!(engine.metrics().wakeups, 0);
    }

    #[test]
    fn zero_boost_ms_disables_migration_sync() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        let engine = engine(
            &soc,
            BoostConfig {
                boost_ms: 0,
                ..Default::default()
            },
        );
        engine.on_task_migrated(0, 1);
        assert_eq!(engine.metrics().wakeups, 0);
        assert_eq!(engine.metrics().query_failures, 0);
    }

    #[test]
    fn source_query_failure_drops_event() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        soc.fail_queries(0, true);
        let engine = engine(&soc, cfg());
        engine.on_task_migrated(0, 1);
        assert_eq!(engine.metrics().query_failures, 1);
        assert!(!engine.cpu_state(1).unwrap().pending);
        assert_eq!(engine.cpu_state(1).unwrap().migration_floor, 0);
    }

    #[test]
    fn suspended_engine_ignores_migrations_when_configured() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        let engine = engine(
            &soc,
            BoostConfig {
                boost_ms: 500,
                disable_while_suspended: true,
                ..Default::default()
            },
        );
        engine.set_suspended(true);
        engine.on_task_migrated(0, 1);
        assert_eq!(engine.metrics().wakeups, 0);

        engine.set_suspended(false);
        engine.on_task_migrated(0, 1);
        // 90% of the destination's 2 GHz maximum
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_800_000));
    }

    #[test]
    fn unknown_destination_is_ignored() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        let engine = engine(&soc, cfg());
        engine.on_task_migrated(0, 17);
        assert_eq!(engine.metrics().wakeups, 0);
    }

    #[test]
    fn load_is_zero_without_load_based_syncs() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 5);
        soc.set_cur(0, 900_000);
        soc.set_max(1, 2_000_000);
        let engine = engine(
            &soc,
            BoostConfig {
                boost_ms: 500,
                load_based_syncs: false,
                ..Default::default()
            },
        );
        engine.on_task_migrated(0, 1);
        // synced to the source's frequency, not to a load fraction of max
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 900_000));
        assert_eq!(engine.metrics().migrations_filtered, 0);
    }
}
