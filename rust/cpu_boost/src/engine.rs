// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: engine lifecycle
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::utils::CachePadded;
use log::error;
use log::info;
use serde::Serialize;

use crate::config::BoostConfig;
use crate::config::Tunables;
use crate::expiry::ExpiryScheduler;
use crate::expiry::TaskId;
use crate::input::NO_INPUT_YET;
use crate::per_cpu::PerCpuSync;
use crate::policy::MigrationNotifier;
use crate::policy::PolicyLayer;
use crate::policy::PolicyNotifier;
use crate::policy::ThermalAdvisor;
use crate::stats::BoostStats;
use crate::stats::Metrics;
use crate::worker;
use crate::worker::WorkerState;
use crate::CpuId;
use crate::Khz;
use crate::FREQ_MAX;

/// State shared by the notifiers, the sync workers and the expiry thread.
pub(crate) struct Shared {
    pub cpus: Box<[CachePadded<PerCpuSync>]>,
    pub tunables: Tunables,
    pub policy: Arc<dyn PolicyLayer>,
    pub thermal: Arc<dyn ThermalAdvisor>,
    pub timers: ExpiryScheduler,
    pub suspended: AtomicBool,
    /// Reference point of `last_input_us`.
    pub epoch: Instant,
    pub last_input_us: AtomicU64,
    pub input_queued: AtomicBool,
    pub app_launch_task: Mutex<Option<TaskId>>,
    pub stats: BoostStats,
}

impl Shared {
    pub fn cpu(&self, cpu: CpuId) -> Option<&PerCpuSync> {
        self.cpus.get(cpu).map(|s| &**s)
    }

    pub fn events_disabled(&self) -> bool {
        self.tunables.disable_while_suspended() && self.suspended.load(Ordering::Acquire)
    }
}

/// Boost state of one CPU, for introspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CpuBoostState {
    pub cpu: CpuId,
    pub worker: WorkerState,
    /// A migration is waiting for the worker.
    pub pending: bool,
    pub migration_floor: Khz,
    /// May be [`FREQ_MAX`] during an app launch boost.
    pub input_floor: Khz,
}

impl CpuBoostState {
    /// Floor this CPU gets under a policy capped at `policy_max`.
    pub fn effective_floor(&self, policy_max: Khz) -> Khz {
        let input = if self.input_floor == FREQ_MAX {
            policy_max
        } else {
            self.input_floor
        };
        self.migration_floor.max(input).min(policy_max)
    }
}

/// The boost engine: one sync worker per CPU plus the shared expiry thread.
///
/// Dropping the engine stops every thread and forgets all floors. The policy
/// layer should stop calling the notifier before that.
pub struct BoostEngine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BoostEngine {
    pub fn start(
        cfg: &BoostConfig,
        nr_cpus: usize,
        policy: Arc<dyn PolicyLayer>,
        thermal: Arc<dyn ThermalAdvisor>,
    ) -> Result<Self> {
        if nr_cpus == 0 {
            bail!("no CPUs to boost");
        }
        let tunables = Tunables::new(cfg)?;
        let timers = ExpiryScheduler::start("cpuboost_wq")?;

        let shared = Arc::new(Shared {
            cpus: (0..nr_cpus)
                .map(|cpu| CachePadded::new(PerCpuSync::new(cpu)))
                .collect(),
            tunables,
            policy,
            thermal,
            timers,
            suspended: AtomicBool::new(false),
            epoch: Instant::now(),
            last_input_us: AtomicU64::new(NO_INPUT_YET),
            input_queued: AtomicBool::new(false),
            app_launch_task: Mutex::new(None),
            stats: BoostStats::default(),
        });

        let mut engine = Self {
            shared,
            workers: Vec::with_capacity(nr_cpus),
        };
        for cpu in 0..nr_cpus {
            let shared = Arc::clone(&engine.shared);
            let handle = std::thread::Builder::new()
                .name(format!("boost_sync/{}", cpu))
                .spawn(move || worker::run(shared, cpu))
                .with_context(|| format!("failed to spawn boost_sync/{}", cpu))?;
            engine.workers.push(handle);
        }

        info!("cpu_boost started on {} CPUs", nr_cpus);
        Ok(engine)
    }

    pub fn tunables(&self) -> &Tunables {
        &self.shared.tunables
    }

    /// Hook to register with the policy layer.
    pub fn notifier(&self) -> Arc<dyn PolicyNotifier> {
        self.shared.clone()
    }

    /// Hook to register with the task migration source.
    pub fn migration_notifier(&self) -> Arc<dyn MigrationNotifier> {
        self.shared.clone()
    }

    pub fn on_task_migrated(&self, src: CpuId, dest: CpuId) {
        self.shared.on_task_migrated(src, dest);
    }

    pub fn on_input_event(&self) -> bool {
        self.shared.input_event_at(Instant::now())
    }

    /// Input event observed at `now`.
    pub fn input_event_at(&self, now: Instant) -> bool {
        self.shared.input_event_at(now)
    }

    pub fn on_app_launch(&self) {
        self.shared.app_launch();
    }

    /// Track system suspend. Events are ignored while suspended if
    /// `disable_while_suspended` is set.
    pub fn set_suspended(&self, suspended: bool) {
        self.shared.suspended.store(suspended, Ordering::Release);
    }

    pub fn cpu_state(&self, cpu: CpuId) -> Option<CpuBoostState> {
        let s = self.shared.cpu(cpu)?;
        Some(CpuBoostState {
            cpu,
            worker: s.state(),
            pending: s.pending(),
            migration_floor: s.migration.floor(),
            input_floor: s.input.floor(),
        })
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.stats.metrics()
    }

    pub fn timers(&self) -> &ExpiryScheduler {
        &self.shared.timers
    }

    pub fn nr_cpus(&self) -> usize {
        self.shared.cpus.len()
    }

    /// Stop the workers and the expiry thread. Idempotent.
    pub fn shutdown(&mut self) {
        for s in self.shared.cpus.iter() {
            s.request_stop();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("sync worker panicked");
            }
        }
        self.shared.timers.stop();
    }
}

impl Drop for BoostEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::testutil::wait_until;
    use crate::testutil::FakeSoc;
    use crate::NoThermal;

    fn engine(soc: &Arc<FakeSoc>, cfg: BoostConfig) -> BoostEngine {
        let engine = BoostEngine::start(&cfg, soc.nr_cpus(), soc.clone(), Arc::new(NoThermal))
            .unwrap();
        soc.register(engine.notifier());
        engine
    }

    fn sync_cfg(boost_ms: u32) -> BoostConfig {
        BoostConfig {
            boost_ms,
            ..Default::default()
        }
    }

    #[test]
    fn start_rejects_invalid_config() {
        let soc = FakeSoc::new(2);
        let cfg = BoostConfig {
            migration_load_threshold: 150,
            ..Default::default()
        };
        assert!(BoostEngine::start(&cfg, 2, soc.clone(), Arc::new(NoThermal)).is_err());
        assert!(BoostEngine::start(&BoostConfig::default(), 0, soc, Arc::new(NoThermal)).is_err());
    }

    #[test]
    fn migration_boost_syncs_and_expires() {
        let soc = FakeSoc::new(4);
        soc.set_util(0, 50);
        soc.set_cur(0, 1_200_000);
        let engine = engine(&soc, sync_cfg(300));

        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| soc.applied_min(1) == 1_200_000));
        assert_eq!(engine.cpu_state(1).unwrap().migration_floor, 1_200_000);
        // the source is re-evaluated but keeps its own limits
        assert!(soc.update_count(0) >= 1);
        assert_eq!(soc.applied_min(0), soc.user_min(0));

        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 0));
        assert!(wait_until(|| soc.applied_min(1) == soc.user_min(1)));
        assert_eq!(engine.metrics().expiries, 1);
    }

    #[test]
    fn coalesced_migrations_use_latest_source() {
        let soc = FakeSoc::new(4);
        for cpu in [0, 2, 3] {
            soc.set_util(cpu, 50);
        }
        soc.set_cur(0, 900_000);
        soc.set_cur(2, 1_100_000);
        soc.set_cur(3, 1_500_000);
        let engine = engine(&soc, sync_cfg(5000));

        // park CPU1's worker inside its first cycle
        let (release, parked) = crossbeam::channel::bounded::<()>(0);
        let entered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&entered);
        soc.on_update(move |cpu| {
            if cpu == 1 {
                seen.fetch_add(1, Ordering::Relaxed);
                let _ = parked.recv();
            }
        });

        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| entered.load(Ordering::Relaxed) == 1));
        engine.on_task_migrated(2, 1);
        engine.on_task_migrated(3, 1);
        assert_eq!(engine.metrics().migrations_coalesced, 1);
        drop(release);

        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_500_000));
        assert!(wait_until(|| engine.cpu_state(1).unwrap().worker == WorkerState::Waiting));
        assert_eq!(engine.metrics().sync_boosts, 2);
        assert!(!engine.cpu_state(1).unwrap().pending);
    }

    #[test]
    fn worker_migrated_onto_own_cpu_does_not_wake_itself() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        let engine = engine(&soc, sync_cfg(5000));

        // Every policy update on CPU1 reports the worker itself arriving there.
        let notifier = engine.migration_notifier();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        soc.on_update(move |cpu| {
            if cpu == 1 {
                seen.fetch_add(1, Ordering::Relaxed);
                notifier.task_migrated(0, 1);
            }
        });

        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_800_000));
        assert!(wait_until(|| engine.metrics().self_wake_skipped >= 1));
        assert!(hits.load(Ordering::Relaxed) >= 1);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().worker == WorkerState::Waiting));
        assert!(!engine.cpu_state(1).unwrap().pending);

        // still responsive
        soc.on_update(|_| {});
        soc.set_util(0, 95);
        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_900_000));
    }

    #[test]
    fn offline_destination_keeps_no_floor() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        soc.set_online(1, false);
        let engine = engine(&soc, sync_cfg(5000));

        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| engine.metrics().sync_boosts == 1));
        assert!(wait_until(|| engine.cpu_state(1).unwrap().worker == WorkerState::Waiting));
        assert_eq!(engine.cpu_state(1).unwrap().migration_floor, 0);
        assert_eq!(soc.update_count(1), 0);
        assert_eq!(engine.timers().nr_pending(), 0);
    }

    #[test]
    fn core_started_repins_worker() {
        let soc = FakeSoc::new(2);
        let engine = engine(&soc, sync_cfg(100));
        assert!(wait_until(|| engine.shared.cpu(1).unwrap().worker.tid().is_some()));
        engine.notifier().core_started(1);
        // unknown CPUs are ignored
        engine.notifier().core_started(42);
    }

    #[test]
    fn core_stopped_drops_floors_and_expiry() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        let engine = engine(&soc, sync_cfg(5000));

        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_800_000));
        assert!(wait_until(|| engine.timers().nr_pending() == 1));

        soc.set_online(1, false);
        engine.notifier().core_stopped(1);
        let state = engine.cpu_state(1).unwrap();
        assert_eq!(state.migration_floor, 0);
        assert_eq!(state.input_floor, 0);
        assert!(!state.pending);
        assert_eq!(engine.timers().nr_pending(), 0);
        assert_eq!(engine.metrics().expiries, 0);
        engine.notifier().core_stopped(42);
    }

    #[test]
    fn tunable_changes_apply_to_later_boosts_only() {
        let soc = FakeSoc::new(2);
        soc.set_util(0, 90);
        let engine = engine(&soc, sync_cfg(300));

        let armed = Instant::now();
        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_800_000));
        // the pending expiry keeps the duration it was armed with
        engine.tunables().set_boost_ms(5000);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 0));
        assert!(armed.elapsed() < Duration::from_millis(2000));
        assert_eq!(engine.metrics().expiries, 1);

        engine.tunables().set_sync_threshold(1_000_000).unwrap();
        engine.on_task_migrated(0, 1);
        assert!(wait_until(|| engine.cpu_state(1).unwrap().migration_floor == 1_000_000));
        assert!(wait_until(|| soc.applied_min(1) == 1_000_000));
        assert_eq!(engine.metrics().expiries, 1);
    }

    #[test]
    fn shutdown_stops_all_workers() {
        let soc = FakeSoc::new(3);
        let mut engine = engine(&soc, sync_cfg(100));
        engine.shutdown();
        for cpu in 0..3 {
            assert_eq!(engine.cpu_state(cpu).unwrap().worker, WorkerState::Stopped);
        }
        // second call is a no-op
        engine.shutdown();
    }

    #[test]
    fn effective_floor_resolves_max_sentinel() {
        let state = CpuBoostState {
            cpu: 0,
            worker: WorkerState::Waiting,
            pending: false,
            migration_floor: 1_000_000,
            input_floor: FREQ_MAX,
        };
        assert_eq!(state.effective_floor(1_800_000), 1_800_000);
        let state = CpuBoostState {
            input_floor: 0,
            ..state
        };
        assert_eq!(state.effective_floor(800_000), 800_000);
    }
}
