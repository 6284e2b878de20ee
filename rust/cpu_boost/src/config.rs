// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: boost tunables
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Boost configuration.
//!
//! [`BoostConfig`] is the serializable form used by config files and the CLI.
//! [`Tunables`] is the live copy read by the engine. Each tunable is stored in
//! its own atomic so it can be changed at any time without a lock; a change only
//! affects decisions taken after it.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::Khz;
use crate::FREQ_MAX;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    /// How long source and destination CPUs stay synchronized after a
    /// migration, in milliseconds. 0 disables migration boosting.
    pub boost_ms: u32,

    /// React only to migrations carrying noticeable load, and size the boost
    /// by that load.
    pub load_based_syncs: bool,

    /// Minimum source CPU utilization (%) for a migration to count.
    pub migration_load_threshold: u32,

    /// Ceiling for synchronized frequencies in kHz (0 = none).
    pub sync_threshold: Khz,

    /// Synchronized frequencies below this are not applied (0 = none).
    pub sync_threshold_min: Khz,

    /// Floor applied to online CPUs after input, in kHz (0 = disabled).
    pub input_boost_freq: Khz,

    pub input_boost_ms: u32,

    pub app_launch_boost_ms: u32,

    /// Ignore all events while the system is suspended.
    pub disable_while_suspended: bool,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            boost_ms: 0,
            load_based_syncs: true,
            migration_load_threshold: 30,
            sync_threshold: 0,
            sync_threshold_min: 0,
            input_boost_freq: 0,
            input_boost_ms: 0,
            app_launch_boost_ms: 1500,
            disable_while_suspended: false,
        }
    }
}

impl BoostConfig {
    pub fn validate(&self) -> Result<()> {
        check_percent("migration_load_threshold", self.migration_load_threshold)?;
        check_freq("sync_threshold", self.sync_threshold)?;
        check_freq("sync_threshold_min", self.sync_threshold_min)?;
        check_freq("input_boost_freq", self.input_boost_freq)?;
        check_sync_range(self.sync_threshold, self.sync_threshold_min)
    }
}

fn check_percent(name: &str, val: u32) -> Result<()> {
    if val > 100 {
        bail!("{} must be a percentage (0-100), got {}", name, val);
    }
    Ok(())
}

fn check_freq(name: &str, val: Khz) -> Result<()> {
    if val == FREQ_MAX {
        bail!("{} value {} is reserved", name, val);
    }
    Ok(())
}

fn check_sync_range(ceiling: Khz, floor: Khz) -> Result<()> {
    if ceiling != 0 && floor > ceiling {
        bail!(
            "sync_threshold_min ({} kHz) is above sync_threshold ({} kHz)",
            floor,
            ceiling
        );
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "y" | "Y" | "yes" | "on" | "true" => Ok(true),
        "0" | "n" | "N" | "no" | "off" | "false" => Ok(false),
        other => bail!("{}: invalid boolean {:?}", name, other),
    }
}

fn parse_u32(name: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .with_context(|| format!("{}: invalid value {:?}", name, value))
}

/// Live tunables shared by every boost path.
#[derive(Debug)]
pub struct Tunables {
    boost_ms: AtomicU32,
    load_based_syncs: AtomicBool,
    migration_load_threshold: AtomicU32,
    sync_threshold: AtomicU32,
    sync_threshold_min: AtomicU32,
    input_boost_freq: AtomicU32,
    input_boost_ms: AtomicU32,
    app_launch_boost_ms: AtomicU32,
    disable_while_suspended: AtomicBool,
}

impl Tunables {
    /// Names accepted by [`Tunables::store_param`].
    pub const PARAMS: &'static [&'static str] = &[
        "boost_ms",
        "load_based_syncs",
        "migration_load_threshold",
        "sync_threshold",
        "sync_threshold_min",
        "input_boost_freq",
        "input_boost_ms",
        "app_launch_boost_ms",
        "disable_while_suspended",
    ];

    pub fn new(cfg: &BoostConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            boost_ms: AtomicU32::new(cfg.boost_ms),
            load_based_syncs: AtomicBool::new(cfg.load_based_syncs),
            migration_load_threshold: AtomicU32::new(cfg.migration_load_threshold),
            sync_threshold: AtomicU32::new(cfg.sync_threshold),
            sync_threshold_min: AtomicU32::new(cfg.sync_threshold_min),
            input_boost_freq: AtomicU32::new(cfg.input_boost_freq),
            input_boost_ms: AtomicU32::new(cfg.input_boost_ms),
            app_launch_boost_ms: AtomicU32::new(cfg.app_launch_boost_ms),
            disable_while_suspended: AtomicBool::new(cfg.disable_while_suspended),
        })
    }

    pub fn boost_ms(&self) -> u32 {
        self.boost_ms.load(Ordering::Relaxed)
    }

    pub fn load_based_syncs(&self) -> bool {
        self.load_based_syncs.load(Ordering::Relaxed)
    }

    pub fn migration_load_threshold(&self) -> u32 {
        self.migration_load_threshold.load(Ordering::Relaxed)
    }

    pub fn sync_threshold(&self) -> Khz {
        self.sync_threshold.load(Ordering::Relaxed)
    }

    pub fn sync_threshold_min(&self) -> Khz {
        self.sync_threshold_min.load(Ordering::Relaxed)
    }

    pub fn input_boost_freq(&self) -> Khz {
        self.input_boost_freq.load(Ordering::Relaxed)
    }

    pub fn input_boost_ms(&self) -> u32 {
        self.input_boost_ms.load(Ordering::Relaxed)
    }

    pub fn app_launch_boost_ms(&self) -> u32 {
        self.app_launch_boost_ms.load(Ordering::Relaxed)
    }

    pub fn disable_while_suspended(&self) -> bool {
        self.disable_while_suspended.load(Ordering::Relaxed)
    }

    pub fn set_boost_ms(&self, ms: u32) {
        self.boost_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_load_based_syncs(&self, on: bool) {
        self.load_based_syncs.store(on, Ordering::Relaxed);
    }

    pub fn set_migration_load_threshold(&self, pct: u32) -> Result<()> {
        check_percent("migration_load_threshold", pct)?;
        self.migration_load_threshold.store(pct, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_sync_threshold(&self, freq: Khz) -> Result<()> {
        check_freq("sync_threshold", freq)?;
        check_sync_range(freq, self.sync_threshold_min())?;
        self.sync_threshold.store(freq, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_sync_threshold_min(&self, freq: Khz) -> Result<()> {
        check_freq("sync_threshold_min", freq)?;
        check_sync_range(self.sync_threshold(), freq)?;
        self.sync_threshold_min.store(freq, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_input_boost_freq(&self, freq: Khz) -> Result<()> {
        check_freq("input_boost_freq", freq)?;
        self.input_boost_freq.store(freq, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_input_boost_ms(&self, ms: u32) {
        self.input_boost_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_app_launch_boost_ms(&self, ms: u32) {
        self.app_launch_boost_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_disable_while_suspended(&self, on: bool) {
        self.disable_while_suspended.store(on, Ordering::Relaxed);
    }

    /// Parse and store a tunable by name, like a write to a module parameter.
    /// On error the previous value is kept.
    pub fn store_param(&self, name: &str, value: &str) -> Result<()> {
        match name {
            "boost_ms" => self.set_boost_ms(parse_u32(name, value)?),
            "load_based_syncs" => self.set_load_based_syncs(parse_bool(name, value)?),
            "migration_load_threshold" => {
                self.set_migration_load_threshold(parse_u32(name, value)?)?
            }
            "sync_threshold" => self.set_sync_threshold(parse_u32(name, value)?)?,
            "sync_threshold_min" => self.set_sync_threshold_min(parse_u32(name, value)?)?,
            "input_boost_freq" => self.set_input_boost_freq(parse_u32(name, value)?)?,
            "input_boost_ms" => self.set_input_boost_ms(parse_u32(name, value)?),
            "app_launch_boost_ms" => self.set_app_launch_boost_ms(parse_u32(name, value)?),
            "disable_while_suspended" => {
                self.set_disable_while_suspended(parse_bool(name, value)?)
            }
            _ => bail!("unknown parameter {:?}", name),
        }
        log::debug!("param {} = {}", name, value.trim());
        Ok(())
    }

    /// Current value of a tunable in its textual form.
    pub fn show_param(&self, name: &str) -> Result<String> {
        let yn = |b: bool| if b { "Y" } else { "N" }.to_string();
        Ok(match name {
            "boost_ms" => self.boost_ms().to_string(),
            "load_based_syncs" => yn(self.load_based_syncs()),
            "migration_load_threshold" => self.migration_load_threshold().to_string(),
            "sync_threshold" => self.sync_threshold().to_string(),
            "sync_threshold_min" => self.sync_threshold_min().to_string(),
            "input_boost_freq" => self.input_boost_freq().to_string(),
            "input_boost_ms" => self.input_boost_ms().to_string(),
            "app_launch_boost_ms" => self.app_launch_boost_ms().to_string(),
            "disable_while_suspended" => yn(self.disable_while_suspended()),
            _ => bail!("unknown parameter {:?}", name),
        })
    }

    pub fn snapshot(&self) -> BoostConfig {
        BoostConfig {
            boost_ms: self.boost_ms(),
            load_based_syncs: self.load_based_syncs(),
            migration_load_threshold: self.migration_load_threshold(),
            sync_threshold: self.sync_threshold(),
            sync_threshold_min: self.sync_threshold_min(),
            input_boost_freq: self.input_boost_freq(),
            input_boost_ms: self.input_boost_ms(),
            app_launch_boost_ms: self.app_launch_boost_ms(),
            disable_while_suspended: self.disable_while_suspended(),
        }
    }
}
