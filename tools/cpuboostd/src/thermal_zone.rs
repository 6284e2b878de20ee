// SPDX-License-Identifier: GPL-2.0
//
// cpuboostd: sysfs thermal zone sensor
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cpu_boost::thermal::TempSensor;
use log::info;

/// `/sys/class/thermal/thermal_zoneN`, read in millidegrees.
#[derive(Debug, Clone)]
pub struct ThermalZone {
    path: PathBuf,
}

impl ThermalZone {
    /// Find a zone under `sys_root`. With `zone_type`, the first zone whose
    /// `type` matches is used, otherwise `thermal_zone0`.
    pub fn find(sys_root: &Path, zone_type: Option<&str>) -> Result<Self> {
        let class = sys_root.join("class/thermal");

        let Some(want) = zone_type else {
            let path = class.join("thermal_zone0");
            if !path.join("temp").exists() {
                bail!("no thermal zone at {}", path.display());
            }
            return Ok(Self { path });
        };

        let mut zones: Vec<PathBuf> = fs::read_dir(&class)
            .with_context(|| format!("failed to list {}", class.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("thermal_zone"))
            })
            .collect();
        zones.sort();

        for path in zones {
            let ty = fs::read_to_string(path.join("type")).unwrap_or_default();
            if ty.trim() == want {
                info!("Using thermal zone {} ({})", path.display(), want);
                return Ok(Self { path });
            }
        }
        bail!("no thermal zone of type {:?}", want)
    }
}

impl TempSensor for ThermalZone {
    fn read_temp(&self) -> Result<i64> {
        let path = self.path.join("temp");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let milli: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("bad temperature {:?} in {}", raw.trim(), path.display()))?;
        Ok(milli / 1000)
    }
}
