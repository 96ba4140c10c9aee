use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::GpioError;

const EVENT_BUFFER_CAPACITY: usize = 64;

/// Interest mask for a monitored value attribute: the kernel reports edge
/// transitions as out-of-band priority data, not ordinary readability.
pub(crate) fn pin_interest() -> EpollFlags {
    EpollFlags::EPOLLPRI | EpollFlags::EPOLLET
}

/// Opaque receipt for one registration. The serial distinguishes it from a
/// later registration that reuses the same descriptor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MonitorToken {
    fd: RawFd,
    serial: u64,
}

#[derive(Debug)]
struct Registration {
    serial: u64,
    pin_number: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEvent {
    pub(crate) fd: RawFd,
    pub(crate) flags: EpollFlags,
}

#[derive(Debug)]
pub(crate) enum MonitorMessage {
    Batch(Vec<ReadyEvent>),
    Failed(Errno),
}

pub(crate) struct InterruptMonitor {
    wait_set: Epoll,
    registrations: Mutex<FxHashMap<RawFd, Registration>>,
    running: AtomicBool,
    next_serial: AtomicU64,
}

impl InterruptMonitor {
    pub(crate) fn new() -> Result<Self, GpioError> {
        let wait_set =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(GpioError::WaitFailure)?;

        Ok(Self {
            wait_set,
            registrations: Mutex::new(FxHashMap::default()),
            running: AtomicBool::new(true),
            next_serial: AtomicU64::new(1),
        })
    }

    /// Adds a descriptor to the wait set. The map entry goes in first so the
    /// earliest possible readiness report already resolves; a failed epoll
    /// add rolls it back.
    pub(crate) fn register(
        &self,
        pin_number: u32,
        fd: RawFd,
        interest: EpollFlags,
    ) -> Result<MonitorToken, GpioError> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut registrations = self.registrations.lock();
        registrations.insert(fd, Registration { serial, pin_number });

        let event = EpollEvent::new(interest, fd as u64);
        if let Err(errno) = self.wait_set.add(unsafe { BorrowedFd::borrow_raw(fd) }, event) {
            registrations.remove(&fd);
            return Err(GpioError::WaitFailure(errno));
        }

        debug!("registered descriptor {fd} for pin {pin_number}");
        Ok(MonitorToken { fd, serial })
    }

    /// Removes a registration. Map removal and the epoll delete share the
    /// critical section, so the next wait cannot report the removed
    /// descriptor. A stale token is ignored: a newer registration on a
    /// reused descriptor number stays untouched.
    pub(crate) fn unregister(&self, token: MonitorToken) {
        let mut registrations = self.registrations.lock();
        match registrations.get(&token.fd) {
            Some(registration) if registration.serial == token.serial => {
                registrations.remove(&token.fd);
            }
            _ => return,
        }

        if let Err(errno) = self
            .wait_set
            .delete(unsafe { BorrowedFd::borrow_raw(token.fd) })
        {
            debug!("wait set removal for descriptor {}: {errno}", token.fd);
        } else {
            debug!("unregistered descriptor {}", token.fd);
        }
    }

    pub(crate) fn resolve(&self, fd: RawFd) -> Option<u32> {
        self.registrations
            .lock()
            .get(&fd)
            .map(|registration| registration.pin_number)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// The background wait loop. Blocks on epoll with a bounded timeout so
    /// `stop` is observed promptly, retries interrupted waits silently, and
    /// forwards each non-empty result set as one batch. Any other wait
    /// failure is fatal: it is reported over the channel and the loop exits.
    pub(crate) fn run(&self, events: UnboundedSender<MonitorMessage>, timeout_ms: u16) {
        debug!("interrupt wait loop started");
        let mut buffer = [EpollEvent::empty(); EVENT_BUFFER_CAPACITY];

        while self.running.load(Ordering::Relaxed) {
            let count = match self.wait_set.wait(&mut buffer, timeout_ms) {
                Ok(count) => count,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!("interrupt wait failed: {errno}");
                    let _ = events.send(MonitorMessage::Failed(errno));
                    break;
                }
            };
            if count == 0 {
                continue;
            }

            let batch = buffer[..count]
                .iter()
                .map(|event| ReadyEvent {
                    fd: event.data() as RawFd,
                    flags: event.events(),
                })
                .collect();
            if events.send(MonitorMessage::Batch(batch)).is_err() {
                // dispatch side is gone, nothing left to deliver to
                break;
            }
        }
        debug!("interrupt wait loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn spawn_loop(
        monitor: &Arc<InterruptMonitor>,
        timeout_ms: u16,
    ) -> (UnboundedReceiver<MonitorMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::clone(monitor);
        let handle = std::thread::spawn(move || runner.run(tx, timeout_ms));
        (rx, handle)
    }

    #[test]
    fn readiness_is_forwarded_as_a_batch() {
        let monitor = Arc::new(InterruptMonitor::new().unwrap());
        let (mut rx, handle) = spawn_loop(&monitor, 50);

        let (reader, mut writer) = std::io::pipe().unwrap();
        let fd = reader.as_raw_fd();
        monitor
            .register(5, fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLET)
            .unwrap();
        writer.write_all(b"x").unwrap();

        match rx.blocking_recv().expect("forwarded batch") {
            MonitorMessage::Batch(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].fd, fd);
                assert!(batch[0].flags.contains(EpollFlags::EPOLLIN));
            }
            MonitorMessage::Failed(errno) => panic!("unexpected wait failure: {errno}"),
        }
        assert_eq!(monitor.resolve(fd), Some(5));

        monitor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn unregistered_descriptor_stops_reporting() {
        let monitor = Arc::new(InterruptMonitor::new().unwrap());

        let (reader, mut writer) = std::io::pipe().unwrap();
        let fd = reader.as_raw_fd();
        let token = monitor
            .register(9, fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLET)
            .unwrap();
        assert_eq!(monitor.resolve(fd), Some(9));

        monitor.unregister(token);
        assert_eq!(monitor.resolve(fd), None);

        let (mut rx, handle) = spawn_loop(&monitor, 10);
        writer.write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(60));
        monitor.stop();
        handle.join().unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_token_does_not_remove_newer_registration() {
        let monitor = InterruptMonitor::new().unwrap();

        let (reader, _writer) = std::io::pipe().unwrap();
        let fd = reader.as_raw_fd();
        let first = monitor
            .register(3, fd, EpollFlags::EPOLLIN)
            .unwrap();
        monitor.unregister(first);
        monitor.register(4, fd, EpollFlags::EPOLLIN).unwrap();

        monitor.unregister(first);
        assert_eq!(monitor.resolve(fd), Some(4));
    }

    #[test]
    fn stop_is_observed_within_one_timeout() {
        let monitor = Arc::new(InterruptMonitor::new().unwrap());
        let (_rx, handle) = spawn_loop(&monitor, 20);

        std::thread::sleep(Duration::from_millis(30));
        monitor.stop();
        let waited = Instant::now();
        handle.join().unwrap();
        assert!(waited.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn regular_files_cannot_join_the_wait_set() {
        let monitor = InterruptMonitor::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "0").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let err = monitor
            .register(1, file.as_raw_fd(), pin_interest())
            .unwrap_err();
        assert!(matches!(err, GpioError::WaitFailure(Errno::EPERM)));
        assert_eq!(monitor.resolve(file.as_raw_fd()), None);
    }
}
