use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::controller::ControllerShared;
use crate::error::GpioError;
use crate::monitor::{MonitorMessage, ReadyEvent};

/// Single-threaded delivery half of the interrupt engine. The monitor thread
/// forwards readiness batches over a channel; this loop turns them into
/// callback invocations, one at a time, in batch order.
pub struct EventDispatcher {
    shared: Arc<ControllerShared>,
    events_rx: UnboundedReceiver<MonitorMessage>,
}

impl EventDispatcher {
    pub(crate) fn new(
        shared: Arc<ControllerShared>,
        events_rx: UnboundedReceiver<MonitorMessage>,
    ) -> Self {
        Self { shared, events_rx }
    }

    /// Drives delivery until the controller shuts down. Ends cleanly when
    /// the monitor thread exits and drops its sender; ends with the wait
    /// error when the monitor reports one.
    pub async fn run(mut self) -> Result<(), GpioError> {
        while let Some(message) = self.events_rx.recv().await {
            match message {
                MonitorMessage::Batch(batch) => self.deliver(&batch),
                MonitorMessage::Failed(errno) => return Err(GpioError::WaitFailure(errno)),
            }
        }

        debug!("event dispatch finished");
        Ok(())
    }

    /// Invokes at most one callback per pin for one readiness batch. Every
    /// lock is released before the callback runs, so callbacks may call back
    /// into the controller freely.
    fn deliver(&self, batch: &[ReadyEvent]) {
        let mut delivered = FxHashSet::default();
        for event in batch {
            let Some(number) = self.shared.monitor.resolve(event.fd) else {
                // registration vanished between the wait and now
                debug!(
                    "readiness for unknown descriptor {} ({:?})",
                    event.fd, event.flags
                );
                continue;
            };
            if !delivered.insert(number) {
                continue;
            }
            let Some(pin) = self.shared.pins.lock().get(&number).cloned() else {
                continue;
            };

            let taken = pin.lock().take_interrupt();
            let Some((value, mut callback)) = taken else {
                continue;
            };
            callback(value);
            pin.lock().restore_callback(callback);
        }
    }
}
