// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: stepwise thermal frequency limiter
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Polls a temperature sensor and caps every CPU's maximum frequency in steps
//! as the temperature climbs over `temp_threshold`. While throttling, the
//! boost paths clamp their floors to the same cap through [`ThermalAdvisor`].

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::error;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::expiry::ExpiryScheduler;
use crate::policy::PolicyLayer;
use crate::policy::PolicyLimits;
use crate::policy::ThermalAdvisor;
use crate::Khz;

/// Source of the SoC temperature, in degrees Celsius.
pub trait TempSensor: Send + Sync {
    fn read_temp(&self) -> Result<i64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThermalLevel {
    pub freq: Khz,
    /// Degrees over `temp_threshold` at which this cap applies.
    pub delta: i64,
}

const fn level(freq: Khz, delta: i64) -> ThermalLevel {
    ThermalLevel { freq, delta }
}

/// Frequency caps from coolest to hottest.
pub const THERMAL_LEVELS: [ThermalLevel; 10] = [
    level(2_726_400, -1),
    level(2_496_000, 0),
    level(2_265_600, 1),
    level(1_958_400, 2),
    level(1_728_000, 3),
    level(1_497_600, 4),
    level(1_267_200, 5),
    level(1_036_800, 6),
    level(729_600, 8),
    level(422_400, 10),
];

/// Poll intervals selectable with `polling_preset`. Index 0 is invalid.
pub const POLLING_INTERVALS_MS: [u64; 8] = [0, 250, 200, 125, 100, 50, 40, 25];

const DISABLED_POLL: Duration = Duration::from_millis(1000);
const COOL_POLL: Duration = Duration::from_millis(250);
const FIRST_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    pub enabled: bool,
    /// Throttling starts around this temperature (°C).
    pub temp_threshold: i64,
    /// Temperature logged as critical (°C).
    pub temp_threshold_crit: i64,
    /// Hysteresis below `temp_threshold` before the cap is lifted.
    pub safe_diff: i64,
    /// Index into [`POLLING_INTERVALS_MS`].
    pub polling_preset: usize,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temp_threshold: 70,
            temp_threshold_crit: 110,
            safe_diff: 5,
            polling_preset: 5,
        }
    }
}

impl ThermalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.polling_preset == 0 || self.polling_preset >= POLLING_INTERVALS_MS.len() {
            bail!(
                "polling_preset must be between 1 and {}",
                POLLING_INTERVALS_MS.len() - 1
            );
        }
        if self.temp_threshold >= self.temp_threshold_crit {
            bail!(
                "temp_threshold ({}) must be below temp_threshold_crit ({})",
                self.temp_threshold,
                self.temp_threshold_crit
            );
        }
        if self.safe_diff < 0 {
            bail!("safe_diff must not be negative");
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(POLLING_INTERVALS_MS[self.polling_preset])
    }
}

pub struct ThermalMonitor {
    cfg: ThermalConfig,
    sensor: Box<dyn TempSensor>,
    policy: Arc<dyn PolicyLayer>,
    throttling: AtomicBool,
    limited_max: AtomicU32,
    critical: AtomicBool,
}

impl ThermalMonitor {
    pub fn new(
        cfg: ThermalConfig,
        sensor: Box<dyn TempSensor>,
        policy: Arc<dyn PolicyLayer>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            sensor,
            policy,
            throttling: AtomicBool::new(false),
            limited_max: AtomicU32::new(Khz::MAX),
            critical: AtomicBool::new(false),
        })
    }

    /// The last reading was at or above `temp_threshold_crit`.
    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Relaxed)
    }

    /// One poll. Returns the delay until the next one.
    pub fn check_temp(&self) -> Duration {
        let temp = match self.sensor.read_temp() {
            Ok(temp) => temp,
            Err(e) => {
                warn!("thermal: failed to read temperature: {:#}", e);
                return DISABLED_POLL;
            }
        };

        let critical = temp >= self.cfg.temp_threshold_crit;
        if critical && !self.critical.load(Ordering::Relaxed) {
            error!(
                "thermal: critical SoC temperature {}°C (limit {}°C)",
                temp, self.cfg.temp_threshold_crit
            );
        }
        self.critical.store(critical, Ordering::Relaxed);

        if !self.cfg.enabled {
            return DISABLED_POLL;
        }

        let delta = temp - self.cfg.temp_threshold;
        let safe_diff = self.cfg.safe_diff;

        if delta < -safe_diff {
            if self.throttling.load(Ordering::Acquire) {
                self.limit_cpu_freqs(Khz::MAX);
                self.throttling.store(false, Ordering::Release);
            }
        } else {
            // Once throttling, the coolest level is never picked again.
            let lowest = self.throttling.load(Ordering::Acquire) as usize;
            let freq = THERMAL_LEVELS[lowest..]
                .iter()
                .rev()
                .find(|l| delta >= l.delta)
                .map(|l| l.freq);
            if let Some(freq) = freq {
                self.throttling.store(true, Ordering::Release);
                self.limit_cpu_freqs(freq);
            }
        }

        if delta >= -3 * safe_diff {
            self.cfg.poll_interval()
        } else {
            COOL_POLL
        }
    }

    /// Cap every online CPU at `max_freq`. `Khz::MAX` lifts the cap.
    pub fn limit_cpu_freqs(&self, max_freq: Khz) -> bool {
        if self.limited_max.swap(max_freq, Ordering::AcqRel) == max_freq {
            return false;
        }
        if max_freq == Khz::MAX {
            info!("thermal: restoring CPU frequencies");
        } else {
            info!("thermal: limiting CPU frequencies to {} kHz", max_freq);
        }
        for cpu in self.policy.online_cpus() {
            self.policy.update_policy(cpu);
        }
        true
    }

    /// Squeeze a policy under the current cap.
    pub fn clamp_limits(&self, limits: &mut PolicyLimits) {
        let max = self.limited_max.load(Ordering::Acquire);
        if max == Khz::MAX {
            return;
        }
        limits.verify_within_limits(limits.cpuinfo_min, max);
    }

    /// Start polling on `timers`. Polling stops with the scheduler.
    pub fn start(self: &Arc<Self>, timers: &ExpiryScheduler) {
        debug!(
            "thermal: polling, threshold {}°C, preset {}",
            self.cfg.temp_threshold, self.cfg.polling_preset
        );
        schedule_check(Arc::downgrade(self), timers.clone(), FIRST_POLL);
    }
}

fn schedule_check(
    monitor: std::sync::Weak<ThermalMonitor>,
    timers: ExpiryScheduler,
    delay: Duration,
) {
    let next = timers.clone();
    timers.schedule(
        delay,
        Box::new(move || {
            if let Some(m) = monitor.upgrade() {
                let delay = m.check_temp();
                schedule_check(Arc::downgrade(&m), next, delay);
            }
        }),
    );
}

impl ThermalAdvisor for ThermalMonitor {
    fn throttling(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    fn limited_max_freq(&self) -> Khz {
        self.limited_max.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use super::*;
    use crate::testutil::wait_until;
    use crate::testutil::FakeSoc;

    #[derive(Default)]
    struct FakeSensor {
        temp: AtomicI64,
        broken: AtomicBool,
    }

    impl TempSensor for Arc<FakeSensor> {
        fn read_temp(&self) -> Result<i64> {
            if self.broken.load(Ordering::Relaxed) {
                bail!("sensor unavailable");
            }
            Ok(self.temp.load(Ordering::Relaxed))
        }
    }

    fn monitor(cfg: ThermalConfig) -> (Arc<FakeSoc>, Arc<FakeSensor>, ThermalMonitor) {
        let soc = FakeSoc::new(2);
        let sensor = Arc::new(FakeSensor::default());
        let m = ThermalMonitor::new(cfg, Box::new(sensor.clone()), soc.clone()).unwrap();
        (soc, sensor, m)
    }

    #[test]
    fn steps_follow_temperature() {
        let (soc, sensor, m) = monitor(ThermalConfig::default());

        sensor.temp.store(60, Ordering::Relaxed);
        assert_eq!(m.check_temp(), Duration::from_millis(50));
        assert!(!m.throttling());
        assert_eq!(soc.update_count(0), 0);

        sensor.temp.store(70, Ordering::Relaxed);
        m.check_temp();
        assert!(m.throttling());
        assert_eq!(m.limited_max_freq(), 2_496_000);
        assert_eq!(soc.update_count(0), 1);
        assert_eq!(soc.update_count(1), 1);

        sensor.temp.store(76, Ordering::Relaxed);
        m.check_temp();
        assert_eq!(m.limited_max_freq(), 1_036_800);

        sensor.temp.store(73, Ordering::Relaxed);
        m.check_temp();
        assert_eq!(m.limited_max_freq(), 1_728_000);

        // same level again: no re-evaluation
        m.check_temp();
        assert_eq!(soc.update_count(0), 3);

        sensor.temp.store(80, Ordering::Relaxed);
        m.check_temp();
        assert_eq!(m.limited_max_freq(), 422_400);
    }

    #[test]
    fn cools_down_with_hysteresis() {
        let (_soc, sensor, m) = monitor(ThermalConfig::default());
        sensor.temp.store(72, Ordering::Relaxed);
        m.check_temp();
        assert_eq!(m.limited_max_freq(), 1_958_400);

        // inside the safe band the coolest level is skipped while throttling
        sensor.temp.store(68, Ordering::Relaxed);
        m.check_temp();
        assert!(m.throttling());
        assert_eq!(m.limited_max_freq(), 1_958_400);

        sensor.temp.store(64, Ordering::Relaxed);
        assert_eq!(m.check_temp(), Duration::from_millis(50));
        assert!(!m.throttling());
        assert_eq!(m.limited_max_freq(), Khz::MAX);

        sensor.temp.store(50, Ordering::Relaxed);
        assert_eq!(m.check_temp(), Duration::from_millis(250));
    }

    #[test]
    fn just_below_threshold_uses_coolest_level() {
        let (_soc, sensor, m) = monitor(ThermalConfig::default());
        sensor.temp.store(69, Ordering::Relaxed);
        m.check_temp();
        assert!(m.throttling());
        assert_eq!(m.limited_max_freq(), 2_726_400);

        let (_soc, sensor, m) = monitor(ThermalConfig::default());
        sensor.temp.store(66, Ordering::Relaxed);
        m.check_temp();
        assert!(!m.throttling());
    }

    #[test]
    fn disabled_monitor_only_watches_critical() {
        let (soc, sensor, m) = monitor(ThermalConfig {
            enabled: false,
            ..Default::default()
        });
        sensor.temp.store(115, Ordering::Relaxed);
        assert_eq!(m.check_temp(), Duration::from_millis(1000));
        assert!(m.is_critical());
        assert!(!m.throttling());
        assert_eq!(soc.update_count(0), 0);
    }

    #[test]
    fn critical_temperature_still_throttles() {
        let (_soc, sensor, m) = monitor(ThermalConfig::default());
        sensor.temp.store(112, Ordering::Relaxed);
        m.check_temp();
        assert!(m.is_critical());
        assert_eq!(m.limited_max_freq(), 422_400);
        sensor.temp.store(90, Ordering::Relaxed);
        m.check_temp();
        assert!(!m.is_critical());
    }

    #[test]
    fn sensor_failure_backs_off() {
        let (_soc, sensor, m) = monitor(ThermalConfig::default());
        sensor.broken.store(true, Ordering::Relaxed);
        assert_eq!(m.check_temp(), Duration::from_millis(1000));
        assert!(!m.throttling());
    }

    #[test]
    fn clamp_limits_caps_max_and_min() {
        let (_soc, _sensor, m) = monitor(ThermalConfig::default());
        let mut limits = PolicyLimits {
            cpu: 0,
            min: 1_200_000,
            max: 2_000_000,
            cpuinfo_min: 300_000,
            cpuinfo_max: 2_200_000,
        };
        let unlimited = limits;
        m.clamp_limits(&mut limits);
        assert_eq!(limits, unlimited);

        m.limit_cpu_freqs(1_036_800);
        m.clamp_limits(&mut limits);
        assert_eq!(limits.max, 1_036_800);
        assert_eq!(limits.min, 1_036_800);
    }

    #[test]
    fn rejects_bad_config() {
        for cfg in [
            ThermalConfig {
                polling_preset: 0,
                ..Default::default()
            },
            ThermalConfig {
                polling_preset: 8,
                ..Default::default()
            },
            ThermalConfig {
                temp_threshold: 110,
                ..Default::default()
            },
            ThermalConfig {
                safe_diff: -1,
                ..Default::default()
            },
        ] {
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn polls_on_scheduler() {
        let (soc, sensor, m) = monitor(ThermalConfig::default());
        let m = Arc::new(m);
        let timers = ExpiryScheduler::start("test_thermal").unwrap();
        sensor.temp.store(75, Ordering::Relaxed);
        m.start(&timers);
        assert!(wait_until(|| m.limited_max_freq() == 1_267_200));
        assert!(soc.update_count(0) >= 1);

        sensor.temp.store(40, Ordering::Relaxed);
        assert!(wait_until(|| !m.throttling()));
        timers.stop();
    }
}
