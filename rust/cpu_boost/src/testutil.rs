// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: in-memory policy layer for tests
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;

use crate::lock;
use crate::policy::PolicyLayer;
use crate::policy::PolicyLimits;
use crate::policy::PolicyNotifier;
use crate::policy::PolicySnapshot;
use crate::CpuId;
use crate::Khz;

type UpdateHook = Arc<dyn Fn(CpuId) + Send + Sync>;

#[derive(Clone, Debug)]
struct FakeCpu {
    online: bool,
    fail: bool,
    user_min: Khz,
    max: Khz,
    cur: Khz,
    util: u32,
    cpuinfo_min: Khz,
    cpuinfo_max: Khz,
    applied_min: Khz,
    updates: usize,
}

impl Default for FakeCpu {
    fn default() -> Self {
        Self {
            online: true,
            fail: false,
            user_min: 300_000,
            max: 2_000_000,
            cur: 300_000,
            util: 0,
            cpuinfo_min: 300_000,
            cpuinfo_max: 2_000_000,
            applied_min: 300_000,
            updates: 0,
        }
    }
}

#[derive(Default)]
struct State {
    cpus: Vec<FakeCpu>,
    notifier: Option<Weak<dyn PolicyNotifier>>,
    hook: Option<UpdateHook>,
}

/// Policy layer that keeps every CPU's policy in memory and runs the
/// registered notifier on each update, like cpufreq does.
#[derive(Default)]
pub(crate) struct FakeSoc {
    state: Mutex<State>,
}

impl FakeSoc {
    pub fn new(nr_cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                cpus: vec![FakeCpu::default(); nr_cpus],
                ..Default::default()
            }),
        })
    }

    fn with<R>(&self, cpu: CpuId, f: impl FnOnce(&mut FakeCpu) -> R) -> R {
        f(&mut lock(&self.state).cpus[cpu])
    }

    pub fn nr_cpus(&self) -> usize {
        lock(&self.state).cpus.len()
    }

    pub fn register(&self, notifier: Arc<dyn PolicyNotifier>) {
        lock(&self.state).notifier = Some(Arc::downgrade(&notifier));
    }

    /// Run `hook` after every policy update, outside the SoC lock.
    pub fn on_update(&self, hook: impl Fn(CpuId) + Send + Sync + 'static) {
        lock(&self.state).hook = Some(Arc::new(hook));
    }

    pub fn set_util(&self, cpu: CpuId, util: u32) {
        self.with(cpu, |c| c.util = util);
    }

    pub fn set_cur(&self, cpu: CpuId, cur: Khz) {
        self.with(cpu, |c| c.cur = cur);
    }

    pub fn set_max(&self, cpu: CpuId, max: Khz) {
        self.with(cpu, |c| c.max = max);
    }

    pub fn set_online(&self, cpu: CpuId, online: bool) {
        self.with(cpu, |c| c.online = online);
    }

    pub fn fail_queries(&self, cpu: CpuId, fail: bool) {
        self.with(cpu, |c| c.fail = fail);
    }

    pub fn applied_min(&self, cpu: CpuId) -> Khz {
        self.with(cpu, |c| c.applied_min)
    }

    pub fn user_min(&self, cpu: CpuId) -> Khz {
        self.with(cpu, |c| c.user_min)
    }

    pub fn max(&self, cpu: CpuId) -> Khz {
        self.with(cpu, |c| c.max)
    }

    pub fn update_count(&self, cpu: CpuId) -> usize {
        self.with(cpu, |c| c.updates)
    }
}

impl PolicyLayer for FakeSoc {
    fn policy(&self, cpu: CpuId) -> Result<PolicySnapshot> {
        let st = lock(&self.state);
        let Some(c) = st.cpus.get(cpu) else {
            bail!("no CPU{}", cpu);
        };
        if c.fail {
            bail!("CPU{} policy unavailable", cpu);
        }
        Ok(PolicySnapshot {
            cpu,
            min: c.applied_min,
            max: c.max,
            cur: c.cur,
            util: c.util,
            cpuinfo_min: c.cpuinfo_min,
            cpuinfo_max: c.cpuinfo_max,
        })
    }

    fn update_policy(&self, cpu: CpuId) {
        let (mut limits, notifier, hook) = {
            let st = lock(&self.state);
            let Some(c) = st.cpus.get(cpu) else {
                return;
            };
            let limits = PolicyLimits {
                cpu,
                min: c.user_min,
                max: c.max,
                cpuinfo_min: c.cpuinfo_min,
                cpuinfo_max: c.cpuinfo_max,
            };
            (limits, st.notifier.clone(), st.hook.clone())
        };

        if let Some(n) = notifier.and_then(|n| n.upgrade()) {
            limits.notify(&*n);
        }
        self.with(cpu, |c| {
            c.applied_min = limits.min;
            c.updates += 1;
        });

        if let Some(hook) = hook {
            hook(cpu);
        }
    }

    fn cpu_online(&self, cpu: CpuId) -> bool {
        lock(&self.state).cpus.get(cpu).is_some_and(|c| c.online)
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        lock(&self.state)
            .cpus
            .iter()
            .enumerate()
            .filter(|(_, c)| c.online)
            .map(|(cpu, _)| cpu)
            .collect()
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub(crate) fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
