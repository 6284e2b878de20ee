// SPDX-License-Identifier: GPL-2.0
//
// cpuboostd: cpufreq sysfs policy layer
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Enforces boost floors and thermal caps by rewriting
//! `cpuN/cpufreq/scaling_{min,max}_freq`. The limits found at startup are the
//! user policy: every update starts from them, runs the thermal clamp and the
//! boost notifier, and writes the result. [`SysfsPolicy::restore`] puts them
//! back.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cpu_boost::thermal::ThermalMonitor;
use cpu_boost::CpuId;
use cpu_boost::Khz;
use cpu_boost::PolicyLayer;
use cpu_boost::PolicyLimits;
use cpu_boost::PolicyNotifier;
use cpu_boost::PolicySnapshot;
use log::debug;
use log::info;
use log::warn;

use crate::cpu_list;

/// /proc/stat is resampled at most this often.
const UTIL_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_khz(path: &Path) -> Result<Khz> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("bad frequency {:?} in {}", raw.trim(), path.display()))
}

fn write_khz(path: &Path, khz: Khz) -> Result<()> {
    fs::write(path, khz.to_string()).with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BaseLimits {
    min: Khz,
    max: Khz,
    cpuinfo_min: Khz,
    cpuinfo_max: Khz,
}

/// Busy and total jiffies of one CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Per-CPU times from the `cpuN` lines of /proc/stat.
fn parse_proc_stat(text: &str) -> HashMap<CpuId, CpuTimes> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(cpu) = fields
            .next()
            .and_then(|name| name.strip_prefix("cpu"))
            .and_then(|id| id.parse::<CpuId>().ok())
        else {
            continue;
        };
        // user nice system idle iowait irq softirq steal
        let vals: Vec<u64> = fields.take(8).filter_map(|v| v.parse().ok()).collect();
        if vals.len() < 5 {
            continue;
        }
        let total: u64 = vals.iter().sum();
        let idle = vals[3] + vals[4];
        out.insert(
            cpu,
            CpuTimes {
                busy: total.saturating_sub(idle),
                total,
            },
        );
    }
    out
}

/// A CPU online state change seen by [`SysfsPolicy::poll_hotplug`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hotplug {
    Started(CpuId),
    Stopped(CpuId),
}

#[derive(Default)]
struct UtilTracker {
    prev: HashMap<CpuId, CpuTimes>,
    util: HashMap<CpuId, u32>,
    sampled: Option<Instant>,
}

impl UtilTracker {
    fn update(&mut self, now: HashMap<CpuId, CpuTimes>) {
        for (cpu, cur) in &now {
            if let Some(prev) = self.prev.get(cpu) {
                let total = cur.total.saturating_sub(prev.total);
                let busy = cur.busy.saturating_sub(prev.busy);
                let util = if total == 0 { 0 } else { busy * 100 / total };
                self.util.insert(*cpu, util.min(100) as u32);
            }
        }
        self.prev = now;
    }
}

pub struct SysfsPolicy {
    cpu_root: PathBuf,
    proc_stat: PathBuf,
    nr_cpu_ids: usize,
    base: Mutex<HashMap<CpuId, BaseLimits>>,
    notifier: Mutex<Option<Weak<dyn PolicyNotifier>>>,
    thermal: Mutex<Option<Weak<ThermalMonitor>>>,
    util: Mutex<UtilTracker>,
    online: Mutex<Vec<bool>>,
    /// Serializes policy updates like the cpufreq policy lock.
    update_lock: Mutex<()>,
}

impl SysfsPolicy {
    pub fn new(sys_root: &Path, proc_stat: &Path) -> Result<Self> {
        let cpu_root = sys_root.join("devices/system/cpu");
        let possible_path = cpu_root.join("possible");
        let possible = fs::read_to_string(&possible_path)
            .with_context(|| format!("failed to read {}", possible_path.display()))?;
        let cpus = cpu_list::parse_cpu_list(&possible)?;
        let nr_cpu_ids = cpu_list::nr_cpu_ids(&cpus);

        if !cpus
            .iter()
            .any(|cpu| cpu_root.join(format!("cpu{}/cpufreq", cpu)).is_dir())
        {
            bail!("no cpufreq policies under {}", cpu_root.display());
        }

        let policy = Self {
            cpu_root,
            proc_stat: proc_stat.to_path_buf(),
            nr_cpu_ids,
            base: Mutex::new(HashMap::new()),
            notifier: Mutex::new(None),
            thermal: Mutex::new(None),
            util: Mutex::new(UtilTracker::default()),
            online: Mutex::new(Vec::new()),
            update_lock: Mutex::new(()),
        };
        for cpu in 0..nr_cpu_ids {
            if let Err(e) = policy.base_limits(cpu) {
                debug!("CPU{}: no user limits yet: {:#}", cpu, e);
            }
        }
        *lock(&policy.online) = (0..nr_cpu_ids).map(|c| policy.cpu_online(c)).collect();
        info!("cpufreq: {} CPU slots, {} online", nr_cpu_ids, policy.online_cpus().len());
        Ok(policy)
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids
    }

    pub fn register_notifier(&self, notifier: &Arc<dyn PolicyNotifier>) {
        *lock(&self.notifier) = Some(Arc::downgrade(notifier));
    }

    pub fn register_thermal(&self, thermal: &Arc<ThermalMonitor>) {
        *lock(&self.thermal) = Some(Arc::downgrade(thermal));
    }

    fn cpufreq(&self, cpu: CpuId, attr: &str) -> PathBuf {
        self.cpu_root.join(format!("cpu{}/cpufreq/{}", cpu, attr))
    }

    /// User limits of `cpu`, captured the first time they are readable.
    fn base_limits(&self, cpu: CpuId) -> Result<BaseLimits> {
        if let Some(base) = lock(&self.base).get(&cpu) {
            return Ok(*base);
        }
        let base = BaseLimits {
            min: read_khz(&self.cpufreq(cpu, "scaling_min_freq"))?,
            max: read_khz(&self.cpufreq(cpu, "scaling_max_freq"))?,
            cpuinfo_min: read_khz(&self.cpufreq(cpu, "cpuinfo_min_freq"))?,
            cpuinfo_max: read_khz(&self.cpufreq(cpu, "cpuinfo_max_freq"))?,
        };
        lock(&self.base).insert(cpu, base);
        Ok(base)
    }

    fn util_of(&self, cpu: CpuId) -> u32 {
        let mut tracker = lock(&self.util);
        let stale = tracker
            .sampled
            .map_or(true, |t| t.elapsed() >= UTIL_SAMPLE_INTERVAL);
        if stale {
            match fs::read_to_string(&self.proc_stat) {
                Ok(text) => tracker.update(parse_proc_stat(&text)),
                Err(e) => debug!("failed to read {}: {}", self.proc_stat.display(), e),
            }
            tracker.sampled = Some(Instant::now());
        }
        tracker.util.get(&cpu).copied().unwrap_or(0)
    }

    fn write_limits(&self, cpu: CpuId, limits: &PolicyLimits) -> Result<()> {
        let min_path = self.cpufreq(cpu, "scaling_min_freq");
        let max_path = self.cpufreq(cpu, "scaling_max_freq");
        let cur_min = read_khz(&min_path)?;
        let cur_max = read_khz(&max_path)?;

        // Never let the written pair cross on the way.
        if limits.min > cur_max {
            if limits.max != cur_max {
                write_khz(&max_path, limits.max)?;
            }
            write_khz(&min_path, limits.min)?;
        } else {
            if limits.min != cur_min {
                write_khz(&min_path, limits.min)?;
            }
            if limits.max != cur_max {
                write_khz(&max_path, limits.max)?;
            }
        }
        Ok(())
    }

    /// CPUs that changed online state since the last call.
    pub fn poll_hotplug(&self) -> Vec<Hotplug> {
        let mut online = lock(&self.online);
        let mut events = Vec::new();
        for cpu in 0..self.nr_cpu_ids {
            let now = self.cpu_online(cpu);
            let Some(was) = online.get_mut(cpu) else {
                continue;
            };
            match (*was, now) {
                (false, true) => events.push(Hotplug::Started(cpu)),
                (true, false) => events.push(Hotplug::Stopped(cpu)),
                _ => {}
            }
            *was = now;
        }
        events
    }

    /// Write the user limits back to every CPU.
    pub fn restore(&self) {
        let _guard = lock(&self.update_lock);
        let base = lock(&self.base).clone();
        for (cpu, b) in base {
            if !self.cpu_online(cpu) {
                continue;
            }
            let limits = PolicyLimits {
                cpu,
                min: b.min,
                max: b.max,
                cpuinfo_min: b.cpuinfo_min,
                cpuinfo_max: b.cpuinfo_max,
            };
            if let Err(e) = self.write_limits(cpu, &limits) {
                warn!("CPU{}: failed to restore limits: {:#}", cpu, e);
            }
        }
    }
}

impl PolicyLayer for SysfsPolicy {
    fn policy(&self, cpu: CpuId) -> Result<PolicySnapshot> {
        if cpu >= self.nr_cpu_ids {
            bail!("CPU{} does not exist", cpu);
        }
        let base = self.base_limits(cpu)?;
        let cur = read_khz(&self.cpufreq(cpu, "scaling_cur_freq"))
            .or_else(|_| read_khz(&self.cpufreq(cpu, "cpuinfo_cur_freq")))?;
        Ok(PolicySnapshot {
            cpu,
            min: read_khz(&self.cpufreq(cpu, "scaling_min_freq"))?,
            max: read_khz(&self.cpufreq(cpu, "scaling_max_freq"))?,
            cur,
            util: self.util_of(cpu),
            cpuinfo_min: base.cpuinfo_min,
            cpuinfo_max: base.cpuinfo_max,
        })
    }

    fn update_policy(&self, cpu: CpuId) {
        let _guard = lock(&self.update_lock);
        let base = match self.base_limits(cpu) {
            Ok(base) => base,
            Err(e) => {
                debug!("CPU{}: skipping policy update: {:#}", cpu, e);
                return;
            }
        };
        let mut limits = PolicyLimits {
            cpu,
            min: base.min,
            max: base.max,
            cpuinfo_min: base.cpuinfo_min,
            cpuinfo_max: base.cpuinfo_max,
        };

        let thermal = lock(&self.thermal).as_ref().and_then(Weak::upgrade);
        if let Some(thermal) = thermal {
            thermal.clamp_limits(&mut limits);
        }
        let notifier = lock(&self.notifier).as_ref().and_then(Weak::upgrade);
        if let Some(notifier) = notifier {
            limits.notify(&*notifier);
        }

        if let Err(e) = self.write_limits(cpu, &limits) {
            warn!("CPU{}: failed to apply {}-{} kHz: {:#}", cpu, limits.min, limits.max, e);
        }
    }

    fn cpu_online(&self, cpu: CpuId) -> bool {
        if cpu >= self.nr_cpu_ids {
            return false;
        }
        let dir = self.cpu_root.join(format!("cpu{}", cpu));
        let online = match fs::read_to_string(dir.join("online")) {
            Ok(s) => s.trim() == "1",
            // CPUs that cannot be unplugged have no online attribute
            Err(_) => dir.is_dir(),
        };
        online && dir.join("cpufreq").is_dir()
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        (0..self.nr_cpu_ids).filter(|&cpu| self.cpu_online(cpu)).collect()
    }
}
