// SPDX-License-Identifier: GPL-2.0
//
// cpuboostd: periodic statistics output
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use cpu_boost::thermal::ThermalMonitor;
use cpu_boost::BoostEngine;
use cpu_boost::Khz;
use cpu_boost::Metrics;
use cpu_boost::ThermalAdvisor;

const TICK: Duration = Duration::from_millis(100);

/// Write the per-interval delta between two snapshots.
pub fn report<W: Write>(prev: &Metrics, cur: &Metrics, w: &mut W) -> Result<()> {
    cur.delta(prev).format(w)
}

/// Boosted CPUs with their effective floors, as `cpu:kHz` pairs.
pub fn report_floors<W: Write>(
    engine: &BoostEngine,
    policy_max: impl Fn(usize) -> u32,
    w: &mut W,
) -> Result<()> {
    let floors: Vec<String> = (0..engine.nr_cpus())
        .filter_map(|cpu| engine.cpu_state(cpu))
        .filter_map(|s| {
            let floor = s.effective_floor(policy_max(s.cpu));
            (floor > 0).then(|| format!("{}:{}", s.cpu, floor))
        })
        .collect();
    if !floors.is_empty() {
        writeln!(w, "[cpu_boost] floors {}", floors.join(" "))?;
    }
    Ok(())
}

/// Thermal cap line, printed only while throttling or critical.
pub fn report_thermal<W: Write>(
    throttling: bool,
    cap: Khz,
    critical: bool,
    w: &mut W,
) -> Result<()> {
    if !throttling && !critical {
        return Ok(());
    }
    write!(w, "[thermal]")?;
    if throttling {
        write!(w, " cap {} kHz", cap)?;
    }
    if critical {
        write!(w, " CRITICAL")?;
    }
    writeln!(w)?;
    Ok(())
}

pub fn monitor(
    engine: &BoostEngine,
    thermal: Option<&ThermalMonitor>,
    intv: Duration,
    shutdown: &AtomicBool,
    policy_max: impl Fn(usize) -> u32,
) -> Result<()> {
    let mut prev = engine.metrics();
    let mut next = Instant::now() + intv;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            std::thread::sleep((next - now).min(TICK));
            continue;
        }
        next += intv;

        let cur = engine.metrics();
        let mut out = std::io::stdout().lock();
        report(&prev, &cur, &mut out)?;
        report_floors(engine, &policy_max, &mut out)?;
        if let Some(t) = thermal {
            report_thermal(t.throttling(), t.limited_max_freq(), t.is_critical(), &mut out)?;
        }
        prev = cur;
    }
    Ok(())
}
