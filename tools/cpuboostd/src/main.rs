// SPDX-License-Identifier: GPL-2.0
//
// cpuboostd: CPU boost daemon
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod cpu_list;
mod input_watch;
mod stats;
mod sysfs;
mod thermal_zone;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use cpu_boost::thermal::ThermalConfig;
use cpu_boost::thermal::ThermalMonitor;
use cpu_boost::BoostConfig;
use cpu_boost::BoostEngine;
use cpu_boost::NoThermal;
use cpu_boost::PolicyLayer;
use cpu_boost::ThermalAdvisor;
use cpu_boost::Tunables;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use signal_hook::consts::SIGUSR1;
use signal_hook::consts::SIGUSR2;
use signal_hook::iterator::Signals;

use crate::sysfs::Hotplug;
use crate::sysfs::SysfsPolicy;
use crate::thermal_zone::ThermalZone;

const HOTPLUG_POLL: Duration = Duration::from_secs(1);

/// cpuboostd: temporarily raises CPU frequency floors on user input and app
/// launches, and caps frequencies when the SoC runs hot.
///
/// Send SIGUSR1 to boost every CPU for an app launch, SIGUSR2 to toggle the
/// suspended state.
#[derive(Debug, Parser)]
#[command(name = "cpuboostd", version)]
struct Opts {
    /// JSON configuration file with optional "boost" and "thermal" sections.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Duration of a migration sync boost in milliseconds. 0 disables syncing.
    #[clap(long)]
    boost_ms: Option<u32>,

    /// Scale sync boosts by the migrating task's load.
    #[clap(long)]
    load_based_syncs: Option<bool>,

    /// Minimum source CPU load (%) for a migration to sync frequencies.
    #[clap(long)]
    migration_load_threshold: Option<u32>,

    /// Ceiling of a sync boost in kHz. 0 means no ceiling.
    #[clap(long)]
    sync_threshold: Option<u32>,

    /// Sync boosts below this frequency (kHz) are not applied. 0 disables.
    #[clap(long)]
    sync_threshold_min: Option<u32>,

    /// Input boost frequency in kHz. 0 disables input boosting.
    #[clap(long)]
    input_boost_freq: Option<u32>,

    /// Input boost duration in milliseconds.
    #[clap(long)]
    input_boost_ms: Option<u32>,

    /// App launch boost duration in milliseconds. 0 disables it.
    #[clap(long)]
    app_launch_boost_ms: Option<u32>,

    /// Ignore events while suspended.
    #[clap(long)]
    disable_while_suspended: Option<bool>,

    /// Set a tunable by name, e.g. --set input_boost_ms=60. May be repeated.
    #[clap(long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Print every tunable with its effective value and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    show_params: bool,

    /// Disable the thermal frequency limiter.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_thermal: bool,

    /// Thermal zone type to read, e.g. "cpu-thermal". Defaults to thermal_zone0.
    #[clap(long)]
    thermal_zone: Option<String>,

    /// Temperature (°C) at which frequency limiting starts.
    #[clap(long)]
    temp_threshold: Option<i64>,

    /// Thermal polling preset, 1 (250ms) to 7 (25ms).
    #[clap(long)]
    polling_preset: Option<usize>,

    /// Do not watch input devices.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_input: bool,

    /// Enable stats output with the specified interval in seconds.
    #[clap(long)]
    stats: Option<f64>,

    #[clap(long, default_value = "/sys", hide = true)]
    sysfs_root: PathBuf,

    #[clap(long, default_value = "/proc/stat", hide = true)]
    proc_stat: PathBuf,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    boost: BoostConfig,
    thermal: ThermalConfig,
}

impl DaemonConfig {
    fn load(opts: &Opts) -> Result<Self> {
        let mut cfg = match &opts.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };

        let b = &mut cfg.boost;
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(v) = opts.$field {
                    b.$field = v;
                })*
            };
        }
        apply!(
            boost_ms,
            load_based_syncs,
            migration_load_threshold,
            sync_threshold,
            sync_threshold_min,
            input_boost_freq,
            input_boost_ms,
            app_launch_boost_ms,
            disable_while_suspended
        );

        if let Some(t) = opts.temp_threshold {
            cfg.thermal.temp_threshold = t;
        }
        if let Some(p) = opts.polling_preset {
            cfg.thermal.polling_preset = p;
        }
        Ok(cfg)
    }
}

/// Apply `--set name=value` assignments in order.
fn apply_sets(tunables: &Tunables, sets: &[String]) -> Result<()> {
    for set in sets {
        let (name, value) = set
            .split_once('=')
            .ok_or_else(|| anyhow!("--set {:?}: expected NAME=VALUE", set))?;
        tunables
            .store_param(name.trim(), value)
            .with_context(|| format!("--set {}", set))?;
    }
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    if lcfg.set_time_offset_to_local().is_err() {
        eprintln!("cpuboostd: failed to set local time offset, logging in UTC");
    }
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn spawn_signal_thread(
    engine: Arc<BoostEngine>,
) -> Result<(signal_hook::iterator::Handle, JoinHandle<()>)> {
    let mut signals = Signals::new([SIGUSR1, SIGUSR2]).context("failed to register signals")?;
    let handle = signals.handle();
    let thread = std::thread::Builder::new()
        .name("cpuboost_sig".into())
        .spawn(move || {
            let mut suspended = false;
            for sig in signals.forever() {
                match sig {
                    SIGUSR1 => {
                        info!("app launch boost");
                        engine.on_app_launch();
                    }
                    SIGUSR2 => {
                        suspended = !suspended;
                        info!("suspended: {}", suspended);
                        engine.set_suspended(suspended);
                    }
                    _ => {}
                }
            }
        })
        .context("failed to spawn signal thread")?;
    Ok((handle, thread))
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let cfg = DaemonConfig::load(&opts)?;
    let tunables = Tunables::new(&cfg.boost)?;
    apply_sets(&tunables, &opts.set)?;

    if opts.show_params {
        for name in Tunables::PARAMS {
            println!("{}={}", name, tunables.show_param(name)?);
        }
        return Ok(());
    }

    init_logging(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let policy = Arc::new(SysfsPolicy::new(&opts.sysfs_root, &opts.proc_stat)?);

    let thermal = if opts.no_thermal {
        None
    } else {
        match ThermalZone::find(&opts.sysfs_root, opts.thermal_zone.as_deref()) {
            Ok(zone) => Some(Arc::new(ThermalMonitor::new(
                cfg.thermal.clone(),
                Box::new(zone),
                policy.clone(),
            )?)),
            Err(e) => {
                warn!("thermal limiter disabled: {:#}", e);
                None
            }
        }
    };
    let advisor: Arc<dyn ThermalAdvisor> = match &thermal {
        Some(t) => t.clone(),
        None => Arc::new(NoThermal),
    };

    let engine = Arc::new(BoostEngine::start(
        &tunables.snapshot(),
        policy.nr_cpu_ids(),
        policy.clone(),
        advisor,
    )?);
    let notifier = engine.notifier();
    policy.register_notifier(&notifier);
    if let Some(t) = &thermal {
        policy.register_thermal(t);
        t.start(engine.timers());
    }

    let (signals, signal_thread) = spawn_signal_thread(engine.clone())?;

    let input_thread = if opts.no_input {
        None
    } else {
        let engine = engine.clone();
        match input_watch::spawn(shutdown.clone(), move || {
            engine.on_input_event();
        }) {
            Ok(jh) => Some(jh),
            Err(e) => {
                warn!("input boost disabled: {:#}", e);
                None
            }
        }
    };

    let stats_thread = if let Some(intv) = opts.stats {
        let shutdown_copy = shutdown.clone();
        let engine = engine.clone();
        let policy = policy.clone();
        let thermal = thermal.clone();
        Some(std::thread::spawn(move || {
            let policy_max = |cpu: usize| policy.policy(cpu).map_or(0, |p| p.max);
            let stats_interval = Duration::from_secs_f64(intv);
            if let Err(e) = stats::monitor(
                &engine,
                thermal.as_deref(),
                stats_interval,
                &shutdown_copy,
                policy_max,
            ) {
                warn!("stats monitor thread finished because of an error {}", e)
            }
        }))
    } else {
        None
    };

    info!("cpuboostd running");
    let mut last_hotplug = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_hotplug.elapsed() < HOTPLUG_POLL {
            continue;
        }
        last_hotplug = Instant::now();
        for ev in policy.poll_hotplug() {
            match ev {
                Hotplug::Started(cpu) => {
                    info!("CPU{} online", cpu);
                    notifier.core_started(cpu);
                    policy.update_policy(cpu);
                }
                Hotplug::Stopped(cpu) => {
                    info!("CPU{} offline", cpu);
                    notifier.core_stopped(cpu);
                }
            }
        }
    }

    info!("shutting down");
    signals.close();
    for jh in [Some(signal_thread), input_thread, stats_thread].into_iter().flatten() {
        let _ = jh.join();
    }
    drop(notifier);
    drop(engine);
    policy.restore();
    Ok(())
}
