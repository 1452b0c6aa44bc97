//! The device session: one controller, its identity and its runtime state.

use core::fmt::Write;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use heapless::String;

use crate::error::{Error, TransportError};
use crate::firmware::{should_update, FirmwareStore, PanelKind, Variant};
use crate::identity::{ChipFamily, ChipIdentity, HelloStatus, Identification, HW_RESET_SETTLE_MS};
use crate::link::Link;
use crate::packet::{self, Frame, Resolution, FRAME_LEN};
use crate::service::TouchSink;
use crate::sync::{DesiredConfig, SyncReport};
use crate::transport::Transport;
use crate::update::{UpdateMonitor, UpdateReport, UpdateSession};

/// The display the driver reports coordinates for.
pub const DEFAULT_DISPLAY: Resolution = Resolution::new(480, 800);
/// Sensor resolution assumed until the controller reports its own.
pub const DEFAULT_SENSOR: Resolution = Resolution::new(576, 960);

const CIRCUIT_VERSION: u8 = 0x01;
const VENDOR_LEN: usize = 16;
const HELLO_TRIES: u8 = 3;

const CMD_CLEAR_RAM: [u8; 4] = [0x53, 0x0A, 0x00, 0x01];
const CMD_ROUGH_CALIBRATE: [u8; 4] = [0x54, 0x29, 0x00, 0x01];
const CMD_POWER_DOWN: [u8; 4] = [0x54, 0x50, 0x00, 0x01];

/// Controller configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config<'a> {
    /// Panel strapped on the hardware-detect line.
    pub panel: PanelKind,
    /// Resolution reported coordinates are scaled to.
    pub display: Resolution,
    /// Fallback sensor resolution while the controller has not reported one.
    pub sensor: Resolution,
    /// Modes reapplied after every reset.
    pub desired: DesiredConfig,
    /// Reset and hello attempts during identification.
    pub identify_retries: u8,
    /// Firmware images for automatic updates.
    pub firmware: FirmwareStore<'a>,
    /// Whether bring-up reflashes outdated or blank controllers.
    pub auto_update: bool,
}

impl Default for Config<'_> {
    fn default() -> Self {
        Self {
            panel: PanelKind::Truly,
            display: DEFAULT_DISPLAY,
            sensor: DEFAULT_SENSOR,
            desired: DesiredConfig::default(),
            identify_retries: 3,
            firmware: FirmwareStore::empty(),
            auto_update: true,
        }
    }
}

/// What [`Controller::handle_ready`] did with a ready event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Decoding is paused by the update lock or by suspend.
    Skipped,
    /// The ready line was no longer asserted.
    Spurious,
    /// A touch report with this many points was delivered.
    Touch(usize),
    /// A watchdog reset was detected and the configuration reapplied.
    Reconciled(SyncReport),
    /// A reset hint, calibration ack or status frame.
    Informational,
    /// The frame could not be read or decoded.
    Dropped,
}

/// What [`Controller::reconcile_tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Paused by the update lock or by suspend.
    Skipped,
    /// Frames arrived during the last period. Nothing to do.
    Rearmed,
    /// The controller was silent, so it was reset and reconfigured.
    Reconciled(SyncReport),
    /// The controller was silent and did not say hello after a reset.
    HelloFailed,
}

/// Requests of the host control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Returns the cached identity.
    GetIdentity,
    /// Re-reads versions and resolution without resetting.
    ProbeIdentity,
    /// Flashes the image for the detected variant, regardless of versions.
    TriggerUpdate,
    /// Pauses frame decoding and reconciliation.
    LockUpdate,
    UnlockUpdate,
    Suspend,
    Resume,
    RoughCalibrate,
    /// Samples the data-ready line.
    QueryReadySignal,
    /// Pulses the reset line.
    Reset,
    /// Resets and re-identifies the controller.
    HwReset,
    CheckRecoveryMode,
    /// Keeps the controller powered across suspend.
    PowerLock,
    PowerUnlock,
    UpdateProgress,
    CircuitVersion,
    Vendor,
    /// Replaces the desired modes and applies them.
    SetDesiredConfig(DesiredConfig),
}

/// Answers of the host control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Identity(ChipIdentity),
    Updated(UpdateReport),
    Done,
    /// `true` while the controller asserts data-ready.
    ReadySignal(bool),
    RecoveryMode(bool),
    Progress(u8),
    CircuitVersion(u8),
    Vendor(String<VENDOR_LEN>),
}

/// An EKTF2K controller and everything known about it.
pub struct Controller<'a, T, D> {
    link: Link<T, D>,
    config: Config<'a>,
    family: ChipFamily,
    identity: ChipIdentity,
    recovery: bool,
    update_locked: bool,
    power_locked: bool,
    suspended: bool,
    frame_seen: bool,
}

impl<'a, T, D> Controller<'a, T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Creates a new `Controller`. Nothing is sent until [`Self::bring_up`].
    ///
    /// # Arguments
    ///
    /// * `transport` - The bus binding, usually an [`crate::I2cTransport`].
    /// * `delay` - Delay source for protocol settles, e.g. `embassy_time::Delay`.
    /// * `config` - Geometry, desired modes and firmware images.
    pub fn new(transport: T, delay: D, config: Config<'a>) -> Self {
        Self {
            link: Link::new(transport, delay),
            config,
            family: ChipFamily::default(),
            identity: ChipIdentity::default(),
            recovery: false,
            update_locked: false,
            power_locked: false,
            suspended: false,
            frame_seen: true,
        }
    }

    /// Releases the transport and the delay source.
    pub fn release(self) -> (T, D) {
        self.link.release()
    }

    pub fn identity(&self) -> ChipIdentity {
        self.identity
    }

    pub fn config(&self) -> &Config<'a> {
        &self.config
    }

    /// Returns `true` if the controller is believed to sit in its bootloader.
    pub fn is_recovery(&self) -> bool {
        self.recovery
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_update_locked(&self) -> bool {
        self.update_locked
    }

    /// The resolution raw coordinates are scaled from.
    pub fn sensor(&self) -> Resolution {
        if self.identity.x_resolution != 0 && self.identity.y_resolution != 0 {
            Resolution::new(self.identity.x_resolution, self.identity.y_resolution)
        } else {
            self.config.sensor
        }
    }

    /// Identifies the controller, flashes it if the firmware store holds a
    /// newer image (or the part is blank) and prepares it for decoding.
    ///
    /// A controller that does not answer at all is kept with a zeroed
    /// identity and never flashed. A failed update is returned only after the
    /// controller has been prepared for decoding anyway.
    pub async fn bring_up(&mut self) -> Result<Option<UpdateReport>, Error<T::Error>> {
        log::trace!("ektf2k::bring_up start");
        let present = match self.identify().await {
            Ok(_) => true,
            Err(Error::ChipAbsent) => {
                log::error!("ektf2k::bring_up no controller answered");
                false
            }
            Err(err) => return Err(err),
        };

        let mut report = Ok(None);
        if present && self.config.auto_update {
            report = self.auto_update().await;
        }

        if self.family == ChipFamily::B {
            self.clear_ram().await;
        }
        self.frame_seen = true;
        log::trace!("ektf2k::bring_up done");
        report
    }

    async fn auto_update(&mut self) -> Result<Option<UpdateReport>, Error<T::Error>> {
        let variant = self.variant();
        let Some(image) = self.config.firmware.select(variant) else {
            log::warn!("ektf2k::auto_update no image for {variant:?}");
            return Ok(None);
        };
        log::info!(
            "ektf2k::auto_update device id 0x{:04x} ver 0x{:04x}, {image:?}",
            self.identity.firmware_id,
            self.identity.firmware_version
        );
        if !should_update(
            self.identity.firmware_id,
            self.identity.firmware_version,
            image.embedded_id(),
            image.embedded_version(),
        ) {
            return Ok(None);
        }
        if self.identity.is_blank() {
            self.recovery = true;
        }
        let monitor = UpdateMonitor::new();
        self.flash(&monitor).await.map(Some)
    }

    /// Flashes the image for the detected variant unconditionally.
    pub async fn update_firmware(&mut self, monitor: &UpdateMonitor) -> Result<UpdateReport, Error<T::Error>> {
        self.flash(monitor).await
    }

    async fn flash(&mut self, monitor: &UpdateMonitor) -> Result<UpdateReport, Error<T::Error>> {
        let image = self
            .config
            .firmware
            .select(self.variant())
            .ok_or(Error::NoImage)?;
        let locked = self.update_locked;
        self.update_locked = true;
        let res = UpdateSession::new(image, self.family, self.recovery)
            .run(&mut self.link, monitor)
            .await;
        self.update_locked = locked;

        let report = res?;
        self.recovery = false;
        self.identity.firmware_version = image.embedded_version();
        if self.identity.is_blank() {
            self.identity.firmware_id = image.embedded_id();
        }
        self.frame_seen = true;
        Ok(report)
    }

    /// Validates `bytes` and registers it as the image for `variant`.
    pub fn add_image(&mut self, variant: Variant, bytes: &'a [u8]) -> Result<(), Error<T::Error>> {
        self.config.firmware = self.config.firmware.with_image(variant, bytes)?;
        Ok(())
    }

    fn variant(&self) -> Variant {
        Variant {
            panel: self.config.panel,
            family: self.family,
        }
    }

    async fn identify(&mut self) -> Result<Identification, Error<T::Error>> {
        match self
            .link
            .identify(&mut self.family, self.config.identify_retries)
            .await
        {
            Ok(ident) => {
                self.identity = ident.identity;
                self.recovery = ident.needs_recovery();
                Ok(ident)
            }
            Err(err) => {
                self.identity = ChipIdentity::unknown(self.family);
                Err(err)
            }
        }
    }

    async fn clear_ram(&mut self) {
        let res = async {
            self.link.send(&CMD_CLEAR_RAM).await?;
            self.link.poll_ready().await?;
            let mut answer = [0u8; 4];
            self.link.recv(&mut answer).await?;
            Ok::<_, TransportError<T::Error>>(answer)
        }
        .await;
        match res {
            Ok(answer) => log::debug!("ektf2k::clear_ram {answer:02x?}"),
            Err(err) => log::warn!("ektf2k::clear_ram failed: {err:?}"),
        }
    }

    /// Waits for the data-ready line, up to `timeout`.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<bool, Error<T::Error>> {
        self.link
            .transport
            .wait_ready(timeout)
            .await
            .map_err(|err| TransportError::Bus(err).into())
    }

    /// Reads and decodes one frame after a ready event, delivering touch
    /// reports to `sink`. Read and decode errors are logged and the frame
    /// is dropped.
    pub async fn handle_ready<S: TouchSink>(&mut self, sink: &mut S) -> FrameOutcome {
        if self.update_locked || self.suspended {
            return FrameOutcome::Skipped;
        }
        self.frame_seen = true;

        match self.link.transport.is_ready() {
            Ok(true) => {}
            Ok(false) => return FrameOutcome::Spurious,
            Err(err) => {
                log::warn!("ektf2k::handle_ready cannot sample ready line: {err:?}");
                return FrameOutcome::Dropped;
            }
        }

        let mut frame = [0u8; FRAME_LEN];
        if let Err(err) = self.link.recv(&mut frame).await {
            log::warn!("ektf2k::handle_ready read failed: {err:?}");
            return FrameOutcome::Dropped;
        }
        log::trace!("ektf2k::handle_ready {frame:02x?}");

        match packet::decode(&frame, self.sensor(), self.config.display) {
            Ok(Frame::Touch(report)) => {
                sink.report(&report);
                sink.sync();
                FrameOutcome::Touch(report.len())
            }
            Ok(Frame::WatchdogReset) => {
                log::info!("ektf2k::handle_ready watchdog reset, reapplying modes");
                FrameOutcome::Reconciled(self.link.reconcile(self.family, self.config.desired).await)
            }
            Ok(Frame::ResetHint) => {
                log::info!("ektf2k::handle_ready controller reset event may have happened");
                FrameOutcome::Informational
            }
            Ok(Frame::CalibrationAck) => {
                log::debug!("ektf2k::handle_ready calibration packet");
                FrameOutcome::Informational
            }
            Ok(Frame::Status) => FrameOutcome::Informational,
            Err(err) => {
                log::warn!("ektf2k::handle_ready {err:?}");
                FrameOutcome::Dropped
            }
        }
    }

    /// Periodic health check. A controller that produced no frame during the
    /// last period is reset and reconfigured.
    pub async fn reconcile_tick(&mut self) -> TickOutcome {
        if self.update_locked || self.suspended {
            return TickOutcome::Skipped;
        }
        if self.frame_seen {
            self.frame_seen = false;
            return TickOutcome::Rearmed;
        }
        if !self.reset_and_hello(HELLO_TRIES).await {
            log::error!("ektf2k::reconcile_tick no hello after reset");
            return TickOutcome::HelloFailed;
        }
        TickOutcome::Reconciled(self.link.reconcile(self.family, self.config.desired).await)
    }

    async fn reset_and_hello(&mut self, tries: u8) -> bool {
        for attempt in 1..=tries {
            if let Err(err) = self.link.reset(HW_RESET_SETTLE_MS).await {
                log::warn!("ektf2k::reset attempt {attempt} failed: {err:?}");
                continue;
            }
            match self.link.probe_hello(&mut self.family).await {
                Ok(HelloStatus::Normal) => return true,
                Ok(status) => log::debug!("ektf2k::reset attempt {attempt}: {status:?}"),
                Err(err) => log::warn!("ektf2k::reset attempt {attempt} failed: {err:?}"),
            }
        }
        false
    }

    /// Stops decoding and, unless the power lock is held, powers the
    /// controller down.
    pub async fn suspend(&mut self) -> Result<(), Error<T::Error>> {
        if self.suspended {
            log::debug!("ektf2k::suspend already suspended");
            return Ok(());
        }
        self.suspended = true;
        if !self.power_locked {
            self.link.send(&CMD_POWER_DOWN).await?;
        }
        Ok(())
    }

    /// Wakes the controller with a reset and reapplies the desired modes.
    ///
    /// Returns `None` if there was nothing to do, because the controller was
    /// not suspended or the power lock kept it running.
    pub async fn resume(&mut self) -> Option<SyncReport> {
        if !self.suspended {
            log::debug!("ektf2k::resume already awake");
            return None;
        }
        self.suspended = false;
        self.frame_seen = true;
        if self.power_locked {
            return None;
        }
        if !self.reset_and_hello(1).await {
            log::error!("ektf2k::resume no hello after reset");
        }
        Some(self.link.reconcile(self.family, self.config.desired).await)
    }

    /// Asks the controller for a rough baseline calibration.
    pub async fn rough_calibrate(&mut self) -> Result<(), Error<T::Error>> {
        if self.update_locked {
            return Err(Error::Locked);
        }
        self.link.send(&CMD_ROUGH_CALIBRATE).await?;
        Ok(())
    }

    /// Resets the controller and identifies it again.
    pub async fn hw_reset(&mut self) -> Result<ChipIdentity, Error<T::Error>> {
        self.identify().await.map(|ident| ident.identity)
    }

    /// `ELAN_KTF2K_x` followed by the firmware version in hex.
    pub fn vendor(&self) -> String<VENDOR_LEN> {
        let mut vendor = String::new();
        // Exactly fills the capacity.
        let _ = write!(vendor, "ELAN_KTF2K_x{:04x}", self.identity.firmware_version);
        vendor
    }

    /// Executes one host control request.
    pub async fn control(
        &mut self,
        command: Command,
        monitor: &UpdateMonitor,
    ) -> Result<Response, Error<T::Error>> {
        log::debug!("ektf2k::control {command:?}");
        match command {
            Command::GetIdentity => Ok(Response::Identity(self.identity)),
            Command::ProbeIdentity => {
                let identity = self.link.probe_capabilities().await?;
                self.family = identity.family;
                self.identity = identity;
                Ok(Response::Identity(identity))
            }
            Command::TriggerUpdate => self.update_firmware(monitor).await.map(Response::Updated),
            Command::LockUpdate => {
                self.update_locked = true;
                Ok(Response::Done)
            }
            Command::UnlockUpdate => {
                self.update_locked = false;
                self.frame_seen = true;
                Ok(Response::Done)
            }
            Command::Suspend => {
                if self.update_locked {
                    return Err(Error::Locked);
                }
                self.suspend().await.map(|_| Response::Done)
            }
            Command::Resume => {
                self.resume().await;
                Ok(Response::Done)
            }
            Command::RoughCalibrate => self.rough_calibrate().await.map(|_| Response::Done),
            Command::QueryReadySignal => self
                .link
                .transport
                .is_ready()
                .map(Response::ReadySignal)
                .map_err(|err| TransportError::Bus(err).into()),
            Command::Reset => {
                self.link.reset(HW_RESET_SETTLE_MS).await?;
                Ok(Response::Done)
            }
            Command::HwReset => self.hw_reset().await.map(Response::Identity),
            Command::CheckRecoveryMode => Ok(Response::RecoveryMode(self.recovery)),
            Command::PowerLock => {
                self.power_locked = true;
                Ok(Response::Done)
            }
            Command::PowerUnlock => {
                self.power_locked = false;
                Ok(Response::Done)
            }
            Command::UpdateProgress => Ok(Response::Progress(monitor.progress())),
            Command::CircuitVersion => Ok(Response::CircuitVersion(CIRCUIT_VERSION)),
            Command::Vendor => Ok(Response::Vendor(self.vendor())),
            Command::SetDesiredConfig(desired) => {
                self.config.desired = desired;
                if !self.update_locked && !self.suspended {
                    self.link.reconcile(self.family, desired).await;
                }
                Ok(Response::Done)
            }
        }
    }
}
