//! The in-application-programming (IAP) page transfer state machine.
//!
//! An [`UpdateSession`] flashes one [`FirmwareImage`] in 249 pages of 132
//! bytes. Each page is acknowledged by the controller, which can ask for the
//! same page again ("rewrite") or fail in a way that forces the whole transfer
//! to restart from ISP entry. Both kinds of retry are bounded.

use core::sync::atomic::{AtomicU8, Ordering};

use embedded_hal_async::delay::DelayNs;

use crate::error::{Error, ProtocolError, UpdateFailure};
use crate::firmware::{FirmwareImage, ImageError, PAGE_COUNT};
use crate::identity::{ChipFamily, HelloStatus};
use crate::link::Link;
use crate::transport::Transport;

/// Rewrite requests tolerated for one page.
pub const PAGE_RETRY: u8 = 30;
/// Restarts from ISP entry tolerated for one session.
pub const IAP_RESTART: u8 = 5;

const ACK_OK: u8 = 0xAA;
const ACK_REWRITE: u8 = 0x55;
const DUMMY_BYTE: u8 = 0x15;
const CHUNK_LEN: usize = 8;

const IAP_RESET_SETTLE_MS: u32 = 20;
const DUMMY_SETTLE_MS: u32 = 10;
const BOUNDARY_PAGE_WAIT_MS: u32 = 600;
const PAGE_WAIT_MS: u32 = 50;
const FAULT_SETTLE_MS: u32 = 50;
const ACCEPT_SETTLE_MS: u32 = 10;

/// Whether the controller said hello after the last page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The new firmware booted and sent a normal hello.
    Confirmed,
    /// Every page was accepted, but no normal hello followed.
    Unconfirmed,
}

/// States of an [`UpdateSession`]. Pages are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    EnteringIsp,
    DummySent,
    PageTransfer(u16),
    AwaitAck(u16),
    Rewriting(u16),
    Restarting,
    Done(Confirmation),
    Failed(UpdateFailure),
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// A page acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    Rewrite,
}

impl Ack {
    /// Classifies the two ack bytes. Only the first byte of an accept matters.
    /// Anything else is a fault that restarts the transfer.
    pub fn decode(ack: [u8; 2]) -> Result<Self, ProtocolError> {
        match ack {
            [ACK_OK, _] => Ok(Self::Accepted),
            [ACK_REWRITE, ACK_REWRITE] => Ok(Self::Rewrite),
            _ => Err(ProtocolError::UnexpectedAck(ack)),
        }
    }
}

const MONITOR_IDLE: u8 = 0;
const MONITOR_RUNNING: u8 = 1;
const MONITOR_CANCELLED: u8 = 2;

/// Cancellation and progress shared between an update and its observers.
///
/// A cancel request only reaches the update running when it is made, and is
/// only honoured before ISP entry and between pages.
#[derive(Debug, Default)]
pub struct UpdateMonitor {
    run_state: AtomicU8,
    progress: AtomicU8,
}

impl UpdateMonitor {
    pub const fn new() -> Self {
        Self {
            run_state: AtomicU8::new(MONITOR_IDLE),
            progress: AtomicU8::new(0),
        }
    }

    /// Asks the running update to stop at the next page boundary.
    ///
    /// Returns `false`, and does nothing, if no update is running.
    pub fn cancel(&self) -> bool {
        match self.run_state.compare_exchange(
            MONITOR_RUNNING,
            MONITOR_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(state) => state == MONITOR_CANCELLED,
        }
    }

    /// Returns `true` while an update is running.
    pub fn is_running(&self) -> bool {
        self.run_state.load(Ordering::Acquire) != MONITOR_IDLE
    }

    /// Percentage of pages accepted by the running or last update.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    fn is_cancelled(&self) -> bool {
        self.run_state.load(Ordering::Acquire) == MONITOR_CANCELLED
    }

    fn start(&self) {
        self.progress.store(0, Ordering::Relaxed);
        self.run_state.store(MONITOR_RUNNING, Ordering::Release);
    }

    fn finish(&self) {
        self.run_state.store(MONITOR_IDLE, Ordering::Release);
    }

    fn set_progress(&self, percent: u8) {
        self.progress.store(percent, Ordering::Relaxed);
    }
}

/// Summary of a completed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub confirmation: Confirmation,
    /// Pages accepted in the final, successful pass.
    pub pages: u16,
    /// Restarts from ISP entry that were needed.
    pub restarts: u8,
}

/// One firmware update run. Never outlives the call that created it.
pub struct UpdateSession<'a> {
    image: FirmwareImage<'a>,
    family: ChipFamily,
    recovery: bool,
    state: UpdateState,
    current_page: u16,
    rewrite_count: u8,
    restart_count: u8,
    logged_decile: u8,
}

impl<'a> UpdateSession<'a> {
    /// Prepares an update of a `family` controller with `image`.
    ///
    /// With `recovery` set the controller is assumed to be waiting in its
    /// bootloader already, so the first entry skips the reset and the ISP
    /// command and only reads the bootloader's answer.
    pub fn new(image: FirmwareImage<'a>, family: ChipFamily, recovery: bool) -> Self {
        Self {
            image,
            family,
            recovery,
            state: UpdateState::Idle,
            current_page: 0,
            rewrite_count: 0,
            restart_count: 0,
            logged_decile: 0,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Last page handed to the controller, 0 before the first one.
    pub fn current_page(&self) -> u16 {
        self.current_page
    }

    pub fn rewrite_count(&self) -> u8 {
        self.rewrite_count
    }

    pub fn restart_count(&self) -> u8 {
        self.restart_count
    }

    /// Percentage of pages accepted in the current pass.
    pub fn progress_percent(&self) -> u8 {
        let accepted = match self.state {
            UpdateState::Done(_) => PAGE_COUNT,
            UpdateState::AwaitAck(page)
            | UpdateState::PageTransfer(page)
            | UpdateState::Rewriting(page) => page - 1,
            _ => 0,
        };
        (accepted as u32 * 100 / PAGE_COUNT as u32) as u8
    }

    /// Drives the session to a terminal state.
    pub(crate) async fn run<T, D>(
        &mut self,
        link: &mut Link<T, D>,
        monitor: &UpdateMonitor,
    ) -> Result<UpdateReport, UpdateFailure>
    where
        T: Transport,
        D: DelayNs,
    {
        log::info!(
            "ektf2k::update start, family {:?}, recovery {}",
            self.family,
            self.recovery
        );
        monitor.start();
        loop {
            let state = self.step(link, monitor).await;
            if state.is_terminal() {
                monitor.finish();
            }
            match state {
                UpdateState::Done(confirmation) => {
                    log::info!("ektf2k::update done ({confirmation:?})");
                    return Ok(UpdateReport {
                        confirmation,
                        pages: self.current_page,
                        restarts: self.restart_count,
                    });
                }
                UpdateState::Failed(failure) => {
                    log::error!(
                        "ektf2k::update failed at page {}: {failure:?}",
                        self.current_page
                    );
                    return Err(failure);
                }
                _ => {}
            }
        }
    }

    /// Performs one transition and returns the new state.
    pub(crate) async fn step<T, D>(
        &mut self,
        link: &mut Link<T, D>,
        monitor: &UpdateMonitor,
    ) -> UpdateState
    where
        T: Transport,
        D: DelayNs,
    {
        self.state = match self.state {
            UpdateState::Idle => {
                if monitor.is_cancelled() {
                    UpdateState::Failed(UpdateFailure::Cancelled)
                } else {
                    UpdateState::EnteringIsp
                }
            }
            UpdateState::EnteringIsp => match self.enter_isp(link).await {
                Ok(()) => UpdateState::DummySent,
                Err(err) => {
                    log::warn!("ektf2k::update ISP entry failed: {err:?}");
                    self.restart_count += 1;
                    self.recovery = false;
                    if self.restart_count >= IAP_RESTART {
                        UpdateState::Failed(UpdateFailure::EntryExhausted)
                    } else {
                        UpdateState::EnteringIsp
                    }
                }
            },
            UpdateState::DummySent => self.next_page(1, monitor),
            UpdateState::PageTransfer(page) => match self.write_page(link, page).await {
                Ok(()) => UpdateState::AwaitAck(page),
                Err(err) => {
                    log::warn!("ektf2k::update page {page} write failed: {err:?}");
                    link.settle_ms(FAULT_SETTLE_MS).await;
                    UpdateState::Restarting
                }
            },
            UpdateState::AwaitAck(page) => self.await_ack(link, page, monitor).await,
            UpdateState::Rewriting(page) => UpdateState::PageTransfer(page),
            UpdateState::Restarting => {
                self.restart_count += 1;
                if self.restart_count >= IAP_RESTART {
                    UpdateState::Failed(UpdateFailure::RestartExhausted)
                } else {
                    log::info!("ektf2k::update restart {}", self.restart_count);
                    self.recovery = false;
                    self.rewrite_count = 0;
                    self.logged_decile = 0;
                    monitor.set_progress(0);
                    UpdateState::EnteringIsp
                }
            }
            terminal @ (UpdateState::Done(_) | UpdateState::Failed(_)) => terminal,
        };
        self.state
    }

    fn next_page(&mut self, page: u16, monitor: &UpdateMonitor) -> UpdateState {
        if monitor.is_cancelled() {
            return UpdateState::Failed(UpdateFailure::Cancelled);
        }
        self.rewrite_count = 0;
        UpdateState::PageTransfer(page)
    }

    async fn enter_isp<T, D>(&mut self, link: &mut Link<T, D>) -> Result<(), Error<T::Error>>
    where
        T: Transport,
        D: DelayNs,
    {
        if !self.recovery {
            link.reset(IAP_RESET_SETTLE_MS).await?;
            if self.family == ChipFamily::B {
                link.poll_ready().await?;
                let mut hello = [0u8; 8];
                if let Err(err) = link.recv(&mut hello).await {
                    log::debug!("ektf2k::update hello drain failed: {err:?}");
                }
            }
            link.send(&self.family.isp_command()).await?;
        }

        let mut answer = [0u8; 4];
        link.recv(&mut answer).await?;
        log::debug!("ektf2k::update ISP answer {answer:02x?}");
        if answer[1] != ACK_OK {
            return Err(ProtocolError::IspRefused(answer[1]).into());
        }

        link.send(&[DUMMY_BYTE]).await?;
        link.settle_ms(DUMMY_SETTLE_MS).await;
        Ok(())
    }

    async fn write_page<T, D>(&mut self, link: &mut Link<T, D>, page: u16) -> Result<(), Error<T::Error>>
    where
        T: Transport,
        D: DelayNs,
    {
        self.current_page = page;
        let bytes = self
            .image
            .page(page)
            .ok_or(ImageError::PageOutOfRange { page })?;
        for chunk in bytes.chunks(CHUNK_LEN) {
            link.send(chunk).await?;
        }
        let wait = if page == 1 || page == PAGE_COUNT {
            BOUNDARY_PAGE_WAIT_MS
        } else {
            PAGE_WAIT_MS
        };
        link.settle_ms(wait).await;
        Ok(())
    }

    async fn await_ack<T, D>(
        &mut self,
        link: &mut Link<T, D>,
        page: u16,
        monitor: &UpdateMonitor,
    ) -> UpdateState
    where
        T: Transport,
        D: DelayNs,
    {
        let mut raw = [0u8; 2];
        let ack: Result<Ack, Error<T::Error>> = match link.recv(&mut raw).await {
            Ok(()) => Ack::decode(raw).map_err(Error::from),
            Err(err) => Err(err.into()),
        };

        match ack {
            Ok(Ack::Accepted) => {
                self.report_progress(page, monitor);
                link.settle_ms(ACCEPT_SETTLE_MS).await;
                if page < PAGE_COUNT {
                    return self.next_page(page + 1, monitor);
                }
                let mut family = self.family;
                match link.probe_hello(&mut family).await {
                    Ok(HelloStatus::Normal) => UpdateState::Done(Confirmation::Confirmed),
                    Ok(status) => {
                        log::warn!("ektf2k::update no normal hello after flashing: {status:?}");
                        UpdateState::Done(Confirmation::Unconfirmed)
                    }
                    Err(err) => {
                        log::warn!("ektf2k::update hello after flashing failed: {err:?}");
                        UpdateState::Done(Confirmation::Unconfirmed)
                    }
                }
            }
            Ok(Ack::Rewrite) => {
                link.settle_ms(FAULT_SETTLE_MS).await;
                self.rewrite_count += 1;
                if self.rewrite_count >= PAGE_RETRY {
                    UpdateState::Failed(UpdateFailure::RewriteExhausted)
                } else {
                    log::info!("ektf2k::update page {page} rewrite {}", self.rewrite_count);
                    UpdateState::Rewriting(page)
                }
            }
            Err(err) => {
                log::warn!("ektf2k::update page {page} faulted: {err:?}");
                link.settle_ms(FAULT_SETTLE_MS).await;
                UpdateState::Restarting
            }
        }
    }

    fn report_progress(&mut self, page: u16, monitor: &UpdateMonitor) {
        let percent = (page as u32 * 100 / PAGE_COUNT as u32) as u8;
        monitor.set_progress(percent);
        if percent / 10 > self.logged_decile {
            self.logged_decile = percent / 10;
            log::info!("ektf2k::update progress {percent}%");
        }
    }
}
