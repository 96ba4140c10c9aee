mod config;
mod controller;
mod dispatch;
mod error;
mod monitor;
mod pin;
mod sysfs;

pub use config::ControllerConfig;
pub use controller::{Controller, PinHandle};
pub use dispatch::EventDispatcher;
pub use error::GpioError;
pub use pin::{InterruptCallback, Pin};
pub use sysfs::{Direction, Edge};
