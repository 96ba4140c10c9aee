use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;

use crate::config::ControllerConfig;
use crate::dispatch::EventDispatcher;
use crate::error::GpioError;
use crate::monitor::InterruptMonitor;
use crate::pin::{InterruptCallback, Pin};
use crate::sysfs::{AttributeStore, Direction, Edge};

/// Shared, lockable handle to one allocated pin.
pub type PinHandle = Arc<Mutex<Pin>>;

pub(crate) struct ControllerShared {
    pub(crate) config: ControllerConfig,
    pub(crate) store: AttributeStore,
    pub(crate) pins: Mutex<FxHashMap<u32, PinHandle>>,
    pub(crate) monitor: Arc<InterruptMonitor>,
    wait_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerShared {
    pub(crate) fn release_pin(&self, number: u32) -> Result<(), GpioError> {
        let Some(pin) = self.pins.lock().remove(&number) else {
            return Err(GpioError::PinNotAllocated(number));
        };
        pin.lock().unexport()
    }

    /// Stops the wait loop, releases every pin and joins the wait thread.
    /// Idempotent; later calls find nothing left to do.
    fn teardown(&self) {
        self.monitor.stop();

        let numbers: Vec<u32> = self.pins.lock().keys().copied().collect();
        for number in numbers {
            if let Err(e) = self.release_pin(number) {
                warn!("shutdown: failed to release pin {number}: {e}");
            }
        }

        if let Some(handle) = self.wait_thread.lock().take()
            && handle.join().is_err()
        {
            warn!("interrupt wait thread panicked");
        }
    }
}

impl Drop for ControllerShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Owner of the pin registry and the interrupt engine. Clones share state;
/// the engine is torn down explicitly via [`Controller::shutdown`] or when
/// the last clone drops.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<ControllerShared>,
}

impl Controller {
    /// Builds the controller and its paired dispatcher and spawns the
    /// interrupt wait thread. The caller drives the returned dispatcher,
    /// typically as a spawned task.
    pub fn start(config: ControllerConfig) -> Result<(Self, EventDispatcher), GpioError> {
        let monitor = Arc::new(InterruptMonitor::new()?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let timeout_ms = clamp_wait_timeout(config.wait_timeout_ms);
        let wait_monitor = Arc::clone(&monitor);
        let wait_thread = std::thread::spawn(move || wait_monitor.run(events_tx, timeout_ms));

        let store = AttributeStore::new(config.sysfs_root.clone());
        let shared = Arc::new(ControllerShared {
            config,
            store,
            pins: Mutex::new(FxHashMap::default()),
            monitor,
            wait_thread: Mutex::new(Some(wait_thread)),
        });
        let dispatcher = EventDispatcher::new(Arc::clone(&shared), events_rx);

        info!("gpio controller started");
        Ok((Self { shared }, dispatcher))
    }

    /// Allocates `number`: validates it, exports the line, applies inversion
    /// and the requested configuration, then records the pin. A `callback`
    /// needs an edge mode other than `none` to ever fire, so that pairing is
    /// rejected up front.
    pub fn allocate(
        &self,
        number: u32,
        direction: Direction,
        callback: Option<InterruptCallback>,
        edge: Edge,
        inverted: bool,
    ) -> Result<PinHandle, GpioError> {
        if !self.shared.config.valid_pins.contains(&number) {
            return Err(GpioError::InvalidPinNumber(number));
        }

        let mut pins = self.shared.pins.lock();
        if pins.contains_key(&number) {
            return Err(GpioError::PinAlreadyAllocated(number));
        }
        if callback.is_some() && edge == Edge::None {
            return Err(GpioError::UnsupportedEdgeInterrupt(number));
        }

        let mut pin = Pin::new(
            number,
            direction,
            self.shared.store.clone(),
            Arc::clone(&self.shared.monitor),
        );
        pin.export()?;
        pin.set_inverted(inverted)?;
        match direction {
            Direction::Output => pin.configure_as_output(None, None)?,
            Direction::Input => pin.apply_input_config(edge, callback)?,
        }

        let handle = Arc::new(Mutex::new(pin));
        pins.insert(number, Arc::clone(&handle));
        debug!("allocated pin {number} ({direction:?})");
        Ok(handle)
    }

    /// Releases the pin: callback detached, monitoring stopped, value handle
    /// closed, line unexported.
    pub fn deallocate(&self, number: u32) -> Result<(), GpioError> {
        debug!("deallocating pin {number}");
        self.shared.release_pin(number)
    }

    /// Shared handle to an allocated pin.
    pub fn lookup(&self, number: u32) -> Result<PinHandle, GpioError> {
        let Some(handle) = self.shared.pins.lock().get(&number).cloned() else {
            debug!("pin {number} is not allocated");
            return Err(GpioError::PinNotAllocated(number));
        };
        Ok(handle)
    }

    /// Reads the pin's current logic level.
    pub fn read_value(&self, number: u32) -> Result<bool, GpioError> {
        self.lookup(number)?.lock().value()
    }

    /// Drives an output pin high.
    pub fn set_pin(&self, number: u32) -> Result<(), GpioError> {
        debug!("setting pin {number}");
        self.lookup(number)?.lock().set_value(true)
    }

    /// Drives an output pin low.
    pub fn reset_pin(&self, number: u32) -> Result<(), GpioError> {
        debug!("resetting pin {number}");
        self.lookup(number)?.lock().set_value(false)
    }

    /// Currently allocated pin numbers, ascending.
    pub fn allocated_pins(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.shared.pins.lock().keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn valid_pins(&self) -> &FxHashSet<u32> {
        &self.shared.config.valid_pins
    }

    /// Stops the interrupt engine and releases every allocated pin. Safe to
    /// call more than once; also runs when the last clone drops.
    pub fn shutdown(&self) {
        info!("gpio controller shutting down");
        self.shared.teardown();
    }
}

/// The wait loop takes its timeout as `u16` milliseconds; larger configured
/// values are capped.
fn clamp_wait_timeout(ms: u64) -> u16 {
    u16::try_from(ms).unwrap_or_else(|_| {
        warn!("wait_timeout_ms {ms} is capped to {} ms", u16::MAX);
        u16::MAX
    })
}
