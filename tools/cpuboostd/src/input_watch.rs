// SPDX-License-Identifier: GPL-2.0
//
// cpuboostd: evdev input watcher
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::Result;
use evdev::AbsoluteAxisType;
use evdev::Device;
use evdev::EventType;
use evdev::Key;
use log::debug;
use log::info;
use log::warn;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;

const EPOLL_TIMEOUT_MS: u16 = 100;
const MAX_EVENTS_PER_FD: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Touchscreen,
    Touchpad,
    Keypad,
}

/// The capabilities that decide whether a device boosts.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputCaps {
    pub abs: bool,
    pub mt_position: bool,
    pub abs_position: bool,
    pub key: bool,
    pub btn_touch: bool,
}

impl InputCaps {
    pub fn of(dev: &Device) -> Self {
        let events = dev.supported_events();
        let axes = dev.supported_absolute_axes();
        let has_axes = |x, y| axes.is_some_and(|a| a.contains(x) && a.contains(y));
        Self {
            abs: events.contains(EventType::ABSOLUTE),
            mt_position: has_axes(
                AbsoluteAxisType::ABS_MT_POSITION_X,
                AbsoluteAxisType::ABS_MT_POSITION_Y,
            ),
            abs_position: has_axes(AbsoluteAxisType::ABS_X, AbsoluteAxisType::ABS_Y),
            key: events.contains(EventType::KEY),
            btn_touch: dev
                .supported_keys()
                .is_some_and(|k| k.contains(Key::BTN_TOUCH)),
        }
    }

    pub fn kind(&self) -> Option<InputKind> {
        if self.abs && self.mt_position {
            Some(InputKind::Touchscreen)
        } else if self.abs && self.key && self.btn_touch && self.abs_position {
            Some(InputKind::Touchpad)
        } else if self.key {
            Some(InputKind::Keypad)
        } else {
            None
        }
    }
}

/// Whether a batch of events carries user activity.
pub fn has_activity(events: impl IntoIterator<Item = EventType>) -> bool {
    events
        .into_iter()
        .any(|ty| ty != EventType::SYNCHRONIZATION)
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            let _ = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

pub struct InputWatcher {
    devs: Vec<Option<(InputKind, Device)>>,
    epoll: Epoll,
}

impl InputWatcher {
    /// Open every boost-worthy device under /dev/input.
    pub fn open() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("failed to create epoll")?;
        let mut devs = Vec::new();

        for (path, dev) in evdev::enumerate() {
            let Some(kind) = InputCaps::of(&dev).kind() else {
                continue;
            };
            let fd = dev.as_raw_fd();
            if fd < 0 {
                continue;
            }
            set_nonblocking(fd);

            // The device owns the fd and outlives its epoll registration.
            let bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let tag = devs.len() as u64;
            if let Err(e) = epoll.add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, tag)) {
                warn!("failed to watch {}: {}", path.display(), e);
                continue;
            }
            info!(
                "Registered {:?} device: {} ({})",
                kind,
                dev.name().unwrap_or("unknown"),
                path.display()
            );
            devs.push(Some((kind, dev)));
        }

        if devs.is_empty() {
            warn!("no touchscreen, touchpad or keypad found, input boost idle");
        }
        Ok(Self { devs, epoll })
    }

    pub fn nr_devices(&self) -> usize {
        self.devs.iter().flatten().count()
    }

    /// Drain one device. Returns false if it went away.
    fn drain(dev: &mut Device) -> io::Result<bool> {
        match dev.fetch_events() {
            Ok(events) => Ok(has_activity(
                events.take(MAX_EVENTS_PER_FD).map(|ev| ev.event_type()),
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Call `on_input` once per batch of activity until `shutdown` is set.
    pub fn run(mut self, shutdown: &AtomicBool, mut on_input: impl FnMut()) -> Result<()> {
        let mut events = vec![EpollEvent::empty(); self.devs.len().max(1)];

        while !shutdown.load(Ordering::Relaxed) {
            let n = match self.epoll.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("epoll_wait failed"),
            };

            let mut active = false;
            for ev in &events[..n] {
                let idx = ev.data() as usize;
                let Some(slot) = self.devs.get_mut(idx) else {
                    continue;
                };
                let Some((kind, dev)) = slot.as_mut() else {
                    continue;
                };
                match Self::drain(dev) {
                    Ok(hit) => active |= hit,
                    Err(e) => {
                        warn!("{:?} device {} gone: {}", kind, idx, e);
                        // closing the fd drops the epoll registration
                        *slot = None;
                    }
                }
            }

            if active {
                on_input();
            }
        }
        debug!("input watcher stopped");
        Ok(())
    }
}

/// Watch input devices on a background thread.
pub fn spawn(
    shutdown: Arc<AtomicBool>,
    on_input: impl FnMut() + Send + 'static,
) -> Result<JoinHandle<()>> {
    let watcher = InputWatcher::open()?;
    info!("watching {} input devices", watcher.nr_devices());
    std::thread::Builder::new()
        .name("cpuboost_input".into())
        .spawn(move || {
            if let Err(e) = watcher.run(&shutdown, on_input) {
                warn!("input watcher finished because of an error {:#}", e);
            }
        })
        .context("failed to spawn input watcher")
}
