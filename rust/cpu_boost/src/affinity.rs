// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: thread placement helpers
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use nix::sched::sched_setaffinity;
use nix::sched::CpuSet;
use nix::unistd::Pid;

use crate::CpuId;

/// Nice value requested for the deferred task thread.
const BOOST_WQ_NICE: libc::c_int = -10;

/// Kernel thread id of the calling thread.
pub(crate) fn current_tid() -> i32 {
    nix::unistd::gettid().as_raw()
}

/// Restrict thread `tid` to `cpu`. A tid of 0 means the calling thread.
pub(crate) fn pin_thread(tid: i32, cpu: CpuId) -> Result<()> {
    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .with_context(|| format!("CPU{} does not fit in a cpu set", cpu))?;
    sched_setaffinity(Pid::from_raw(tid), &cpuset)
        .with_context(|| format!("failed to bind thread {} to CPU{}", tid, cpu))?;
    Ok(())
}

pub(crate) fn pin_current_thread(cpu: CpuId) -> Result<()> {
    pin_thread(0, cpu)
}

/// Best effort: needs CAP_SYS_NICE, failures are only logged.
pub(crate) fn raise_current_thread_priority() {
    // On Linux PRIO_PROCESS with who=0 applies to the calling thread only.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, BOOST_WQ_NICE) };
    if ret != 0 {
        log::debug!(
            "could not raise priority of {:?}: {}",
            std::thread::current().name(),
            std::io::Error::last_os_error()
        );
    }
}
