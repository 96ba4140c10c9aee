use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use log::debug;

use crate::error::GpioError;
use crate::monitor::{self, InterruptMonitor, MonitorToken};
use crate::sysfs::{self, AttributeStore, Direction, Edge};

/// Edge-interrupt callback, invoked with the pin's current logic level.
pub type InterruptCallback = Box<dyn FnMut(bool) + Send + 'static>;

/// One exported GPIO line: its configuration, its value handle, and (for
/// monitored inputs) its registration with the interrupt monitor.
pub struct Pin {
    number: u32,
    direction: Direction,
    edge: Edge,
    inverted: bool,
    store: AttributeStore,
    monitor: Arc<InterruptMonitor>,
    value_file: Option<File>,
    callback: Option<InterruptCallback>,
    token: Option<MonitorToken>,
}

impl Pin {
    pub(crate) fn new(
        number: u32,
        direction: Direction,
        store: AttributeStore,
        monitor: Arc<InterruptMonitor>,
    ) -> Self {
        Self {
            number,
            direction,
            edge: Edge::None,
            inverted: false,
            store,
            monitor,
            value_file: None,
            callback: None,
            token: None,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    pub fn inverted(&self) -> bool {
        self.inverted
    }

    /// Writes the active-low attribute. Takes effect on future reads without
    /// disturbing an existing interrupt registration.
    pub fn set_inverted(&mut self, inverted: bool) -> Result<(), GpioError> {
        self.store.write_active_low(self.number, inverted)?;
        self.inverted = inverted;
        Ok(())
    }

    /// Reads the current logic level, negated when inverted. Opens the value
    /// handle on first use; never touches the interrupt registration.
    pub fn value(&mut self) -> Result<bool, GpioError> {
        self.ensure_value_handle()?;
        self.read_level()
    }

    /// Writes the raw level. Meaningful only while the pin is an output; the
    /// kernel rejects writes to inputs and that surfaces as an I/O error.
    pub fn set_value(&mut self, value: bool) -> Result<(), GpioError> {
        self.ensure_value_handle()?;
        self.write_level(value)
    }

    /// Raw descriptor of the open value handle.
    pub fn file_descriptor(&self) -> Result<RawFd, GpioError> {
        match &self.value_file {
            Some(file) => Ok(file.as_raw_fd()),
            None => Err(GpioError::ValueHandleNotOpen(self.number)),
        }
    }

    /// Makes the line an output. Any interrupt registration and callback are
    /// torn down first and a non-`none` edge mode is reset while the line is
    /// still an input. Inversion, when given, lands before the direction
    /// write so the driven level matches intent the instant direction flips.
    /// `initial` uses the kernel's combined direction+value payloads.
    pub fn configure_as_output(
        &mut self,
        initial: Option<bool>,
        inverted: Option<bool>,
    ) -> Result<(), GpioError> {
        if !self.store.has_direction(self.number) {
            return Err(GpioError::UnsupportedDirectionChange(self.number));
        }

        self.unregister_monitor();
        self.callback = None;
        if self.edge != Edge::None && self.store.has_edge(self.number) {
            self.store.write_edge(self.number, Edge::None)?;
        }
        self.edge = Edge::None;

        if let Some(inverted) = inverted {
            self.set_inverted(inverted)?;
        }
        self.store
            .write_direction(self.number, Direction::Output, initial)?;
        self.direction = Direction::Output;

        Ok(())
    }

    /// Makes the line an input, deriving the kernel edge mode from which
    /// handlers are present. Both handlers merge into one callback routing
    /// on the delivered level.
    pub fn configure_as_input(
        &mut self,
        on_rising: Option<InterruptCallback>,
        on_falling: Option<InterruptCallback>,
    ) -> Result<(), GpioError> {
        let edge = edge_for_handlers(on_rising.is_some(), on_falling.is_some());
        self.apply_input_config(edge, merge_handlers(on_rising, on_falling))
    }

    pub(crate) fn apply_input_config(
        &mut self,
        edge: Edge,
        callback: Option<InterruptCallback>,
    ) -> Result<(), GpioError> {
        if edge != Edge::None && !self.store.has_edge(self.number) {
            return Err(GpioError::UnsupportedEdgeInterrupt(self.number));
        }

        self.unregister_monitor();
        self.callback = None;
        // fixed-direction input lines expose no direction attribute; the
        // write only happens where the kernel accepts one
        if self.store.has_direction(self.number) {
            self.store
                .write_direction(self.number, Direction::Input, None)?;
        }
        self.direction = Direction::Input;

        if self.store.has_edge(self.number) {
            self.store.write_edge(self.number, edge)?;
        }
        self.edge = edge;

        // the callback lands only once the descriptor is in the wait set,
        // so a failed registration leaves the pin unarmed
        if let Some(callback) = callback {
            self.ensure_value_handle()?;
            let fd = self.file_descriptor()?;
            self.token = Some(
                self.monitor
                    .register(self.number, fd, monitor::pin_interest())?,
            );
            self.install_callback(Some(callback));
        }

        Ok(())
    }

    /// Unregisters from the monitor (if registered), detaches the callback
    /// and drops the value handle. The wait loop never observes a closed
    /// descriptor.
    pub fn close(&mut self) {
        self.unregister_monitor();
        self.callback = None;
        self.value_file = None;
    }

    pub(crate) fn export(&self) -> Result<(), GpioError> {
        self.store.export(self.number)
    }

    pub(crate) fn unexport(&mut self) -> Result<(), GpioError> {
        self.close();
        self.store.unexport(self.number)
    }

    pub(crate) fn install_callback(&mut self, callback: Option<InterruptCallback>) {
        self.callback = callback;
    }

    /// Arms the pin against an arbitrary descriptor. Fake attribute trees
    /// back the value handle with regular files, which the wait set refuses,
    /// so exercising delivery requires a pollable stand-in such as a pipe.
    #[cfg(test)]
    pub(crate) fn arm_with_descriptor(
        &mut self,
        fd: RawFd,
        interest: nix::sys::epoll::EpollFlags,
        callback: InterruptCallback,
    ) -> Result<(), GpioError> {
        self.ensure_value_handle()?;
        self.install_callback(Some(callback));
        self.token = Some(self.monitor.register(self.number, fd, interest)?);
        Ok(())
    }

    /// Dispatch-side sampling: the current level plus the callback, taken out
    /// so it can run without the pin lock held. Returns `None` when the pin
    /// is mid-teardown (handle closed) or has no callback.
    pub(crate) fn take_interrupt(&mut self) -> Option<(bool, InterruptCallback)> {
        if self.value_file.is_none() {
            return None;
        }
        match self.read_level() {
            Ok(value) => self.callback.take().map(|callback| (value, callback)),
            Err(e) => {
                debug!("pin {}: value read after readiness event: {e}", self.number);
                None
            }
        }
    }

    /// Puts a taken callback back unless reconfiguration replaced or removed
    /// the registration in the meantime.
    pub(crate) fn restore_callback(&mut self, callback: InterruptCallback) {
        if self.token.is_some() && self.callback.is_none() {
            self.callback = Some(callback);
        }
    }

    fn unregister_monitor(&mut self) {
        if let Some(token) = self.token.take() {
            self.monitor.unregister(token);
        }
    }

    fn ensure_value_handle(&mut self) -> Result<(), GpioError> {
        if self.value_file.is_none() {
            self.value_file = Some(self.store.open_value(self.number)?);
        }
        Ok(())
    }

    fn read_level(&mut self) -> Result<bool, GpioError> {
        let number = self.number;
        let inverted = self.inverted;
        let path = self.store.value_path(number);
        let Some(file) = self.value_file.as_mut() else {
            return Err(GpioError::ValueHandleNotOpen(number));
        };

        file.seek(SeekFrom::Start(0)).map_err(|source| GpioError::Io {
            path: path.clone(),
            source,
        })?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|source| GpioError::Io { path, source })?;

        Ok(sysfs::parse_level(&raw)? ^ inverted)
    }

    fn write_level(&mut self, value: bool) -> Result<(), GpioError> {
        let path = self.store.value_path(self.number);
        let Some(file) = self.value_file.as_mut() else {
            return Err(GpioError::ValueHandleNotOpen(self.number));
        };

        file.seek(SeekFrom::Start(0)).map_err(|source| GpioError::Io {
            path: path.clone(),
            source,
        })?;
        file.write_all(sysfs::level_payload(value).as_bytes())
            .map_err(|source| GpioError::Io { path, source })?;

        Ok(())
    }
}

fn edge_for_handlers(rising: bool, falling: bool) -> Edge {
    match (rising, falling) {
        (false, false) => Edge::None,
        (true, false) => Edge::Rising,
        (false, true) => Edge::Falling,
        (true, true) => Edge::Both,
    }
}

fn merge_handlers(
    on_rising: Option<InterruptCallback>,
    on_falling: Option<InterruptCallback>,
) -> Option<InterruptCallback> {
    match (on_rising, on_falling) {
        (None, None) => None,
        (Some(rising), None) => Some(rising),
        (None, Some(falling)) => Some(falling),
        (Some(mut rising), Some(mut falling)) => Some(Box::new(move |state: bool| {
            if state {
                rising(state)
            } else {
                falling(state)
            }
        })),
    }
}
