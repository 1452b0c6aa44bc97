//! An asynchronous, `no_std` driver for ELAN EKTF2K touch controllers.
//!
//! The driver identifies the controller, keeps its firmware current through
//! the in-application programming (IAP) bootloader, decodes its touch frames
//! and restores its operating and talking modes whenever it resets itself.
//!
//! # Usage
//!
//! Wrap the I2C bus and the interrupt and reset pins in an [`I2cTransport`],
//! bring the [`Controller`] up once, then hand it to a [`Service`]. The
//! service is the only task that talks to the controller. Other tasks reach
//! it through a shared [`ControlPort`] and receive touch reports through any
//! [`TouchSink`], for example an `embassy-sync` channel sender.
//!
//! ```no_run
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embassy_sync::channel::Channel;
//! use embedded_hal::digital::{InputPin, OutputPin};
//! use embedded_hal_async::delay::DelayNs;
//! use embedded_hal_async::digital::Wait;
//! use embedded_hal_async::i2c::I2c;
//! use ektf2k_touch_async::{
//!     Command, Config, ControlPort, Controller, I2cTransport, Response, Service, TouchReport,
//! };
//!
//! static PORT: ControlPort<CriticalSectionRawMutex> = ControlPort::new();
//! static REPORTS: Channel<CriticalSectionRawMutex, TouchReport, 4> = Channel::new();
//!
//! async fn touch_task<I2C, INT, RST, D>(i2c: I2C, int: INT, rst: RST, delay: D) -> !
//! where
//!     I2C: I2c,
//!     INT: InputPin + Wait,
//!     RST: OutputPin<Error = INT::Error>,
//!     D: DelayNs + Clone,
//! {
//!     let transport = I2cTransport::new(i2c, int, rst, delay.clone());
//!     let mut controller = Controller::new(transport, delay, Config::default());
//!     if let Err(err) = controller.bring_up().await {
//!         log::error!("touch bring-up failed: {err:?}");
//!     }
//!
//!     let mut service = Service::new(controller, &PORT);
//!     service.run(&mut REPORTS.sender()).await
//! }
//!
//! async fn print_vendor() {
//!     if let Ok(Response::Vendor(vendor)) = PORT.call(Command::Vendor).await {
//!         log::info!("touch controller {vendor}");
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod controller;
pub mod error;
pub mod firmware;
pub mod identity;
pub(crate) mod link;
pub mod packet;
pub mod service;
pub mod sync;
pub mod transport;
pub mod update;

#[cfg(test)]
mod mock;

pub use controller::{Command, Config, Controller, FrameOutcome, Response, TickOutcome};
pub use error::{Error, ErrorCode};
pub use firmware::{FirmwareImage, FirmwareStore, PanelKind, Variant};
pub use identity::{ChipFamily, ChipIdentity};
pub use packet::{Resolution, TouchPoint, TouchReport};
pub use service::{ControlPort, Event, Request, Service, TouchSink};
pub use sync::DesiredConfig;
pub use transport::{I2cTransport, Transport};
pub use update::{UpdateMonitor, UpdateReport};
