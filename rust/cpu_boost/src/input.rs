// SPDX-License-Identifier: GPL-2.0
//
// cpu_boost: input and app launch boosting
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Input boosting raises every online, underclocked CPU to `input_boost_freq`
//! for `input_boost_ms` after user input. App launch boosting raises every CPU
//! to its policy maximum for `app_launch_boost_ms`. Both write the same per-CPU
//! input floor, so whichever comes last wins.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;

use crate::engine::Shared;
use crate::lock;
use crate::CpuId;
use crate::FREQ_MAX;
use crate::MIN_INPUT_INTERVAL_US;

/// `last_input_us` value before the first accepted event.
pub(crate) const NO_INPUT_YET: u64 = u64::MAX;

impl Shared {
    /// Debounce an input event at `now` and queue a boost pass for it.
    /// Returns true if a pass was queued.
    pub(crate) fn input_event_at(self: &Arc<Self>, now: Instant) -> bool {
        self.stats.input_events.fetch_add(1, Ordering::Relaxed);

        if self.events_disabled() || self.tunables.input_boost_freq() == 0 {
            return false;
        }

        let now_us = now.saturating_duration_since(self.epoch).as_micros() as u64;
        let last = self.last_input_us.load(Ordering::Acquire);
        if last != NO_INPUT_YET && now_us.saturating_sub(last) < MIN_INPUT_INTERVAL_US {
            self.stats.input_debounced.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // one pass in flight at a time
        if self.input_queued.swap(true, Ordering::AcqRel) {
            self.stats.input_debounced.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let weak = Arc::downgrade(self);
        self.timers.queue(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.input_queued.store(false, Ordering::Release);
                shared.apply_input_boost();
            }
        }));
        self.last_input_us.store(now_us, Ordering::Release);
        true
    }

    /// Boost pass over all online CPUs.
    pub(crate) fn apply_input_boost(self: &Arc<Self>) {
        let target = self.tunables.input_boost_freq();
        if target == 0 {
            return;
        }
        let delay = Duration::from_millis(self.tunables.input_boost_ms() as u64);

        for cpu in self.policy.online_cpus() {
            let Some(s) = self.cpus.get(cpu) else {
                continue;
            };
            let Ok(policy) = self.policy.policy(cpu) else {
                self.stats.query_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if policy.cur >= target {
                continue;
            }

            let floor = self.thermal.clamp(target);
            let gen = s.input.set(floor, &self.timers);
            if !self.policy.cpu_online(cpu) {
                s.input.reset(&self.timers);
                continue;
            }
            self.policy.update_policy(cpu);
            self.stats.input_boosts.fetch_add(1, Ordering::Relaxed);
            debug!("CPU{}: input boost {} kHz", cpu, floor);

            let weak = Arc::downgrade(self);
            s.input.arm(gen, || {
                self.timers.schedule_on(
                    cpu,
                    delay,
                    Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.remove_input_boost(&[(cpu, gen)]);
                        }
                    }),
                )
            });
        }
        self.stats.input_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the input floors listed as `(cpu, generation)`.
    pub(crate) fn remove_input_boost(&self, floors: &[(CpuId, u64)]) {
        for &(cpu, gen) in floors {
            if !self.cpus[cpu].input.expire(gen) {
                continue;
            }
            debug!("Removing input boost for CPU{}", cpu);
            self.stats.expiries.fetch_add(1, Ordering::Relaxed);
            if self.policy.cpu_online(cpu) {
                self.policy.update_policy(cpu);
            }
        }
    }

    /// Boost every CPU to its policy maximum for `app_launch_boost_ms`.
    pub(crate) fn app_launch(self: &Arc<Self>) {
        let ms = self.tunables.app_launch_boost_ms();
        if ms == 0 {
            return;
        }
        self.stats.app_launches.fetch_add(1, Ordering::Relaxed);

        let mut task = lock(&self.app_launch_task);
        if let Some(id) = task.take() {
            self.timers.cancel(id);
        }

        // Offline CPUs too, so they come up boosted.
        let floors: Vec<(CpuId, u64)> = self
            .cpus
            .iter()
            .map(|s| (s.cpu, s.input.set(FREQ_MAX, &self.timers)))
            .collect();

        for cpu in self.policy.online_cpus() {
            if cpu < self.cpus.len() {
                self.policy.update_policy(cpu);
            }
        }
        debug!("app launch boost for {} ms", ms);

        let weak = Arc::downgrade(self);
        *task = Some(self.timers.schedule(
            Duration::from_millis(ms as u64),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.remove_input_boost(&floors);
                }
            }),
        ));
    }
}
