// SPDX-License-Identifier: GPL-2.0
use std::collections::BTreeSet;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;

/// Upper bound on CPU ids accepted from sysfs masks.
const MAX_CPUS: usize = 4096;

/// Parse a kernel CPU list such as `0-3,5` (the format of
/// `/sys/devices/system/cpu/{possible,online}`) into sorted CPU ids.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    if list
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        bail!("Invalid character in CPU list {:?}", list);
    }

    let mut cpus = BTreeSet::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (start, end) = match token.split_once('-') {
            Some((start, end)) => (parse_cpu(start)?, parse_cpu(end)?),
            None => {
                let cpu = parse_cpu(token)?;
                (cpu, cpu)
            }
        };
        if start > end {
            bail!("Invalid CPU range: {}-{}", start, end);
        }
        if end >= MAX_CPUS {
            bail!("CPU {} out of range (max {})", end, MAX_CPUS - 1);
        }
        cpus.extend(start..=end);
    }

    Ok(cpus.into_iter().collect())
}

fn parse_cpu(s: &str) -> Result<usize> {
    s.trim()
        .parse::<usize>()
        .map_err(|_| anyhow!("Invalid CPU: {:?}", s))
}

/// Number of CPU slots needed to index every CPU in `cpus`.
pub fn nr_cpu_ids(cpus: &[usize]) -> usize {
    cpus.iter().max().map_or(0, |max| max + 1)
}
