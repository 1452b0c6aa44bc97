//! Event dispatch for a running controller.
//!
//! A [`Service`] is the single consumer of everything that needs the
//! transport: data-ready events, periodic reconciliation ticks and host
//! control requests. It handles one event at a time, so at most one exchange
//! is ever in flight. While the update lock is held or the controller is
//! suspended, only control requests are dispatched.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, Sender};
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;

use crate::controller::{Command, Controller, Response};
use crate::error::ErrorCode;
use crate::packet::TouchReport;
use crate::transport::Transport;
use crate::update::UpdateMonitor;

/// Silence after which the controller's health is checked.
pub const RECONCILE_PERIOD: Duration = Duration::from_millis(2500);

/// Receives decoded touch reports.
pub trait TouchSink {
    /// Called once per touch frame. An empty report means no contact.
    fn report(&mut self, report: &TouchReport);

    /// Called after each report to mark the frame boundary.
    fn sync(&mut self) {}
}

impl<M: RawMutex, const N: usize> TouchSink for Sender<'_, M, TouchReport, N> {
    fn report(&mut self, report: &TouchReport) {
        if self.try_send(report.clone()).is_err() {
            log::warn!("ektf2k::sink queue full, report dropped");
        }
    }
}

/// A queued control request, tagged with the sequence number of its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    seq: u32,
    command: Command,
}

impl Request {
    pub fn command(&self) -> Command {
        self.command
    }
}

/// The host side of the control surface, shared between the [`Service`] and
/// any number of requesting tasks.
pub struct ControlPort<M: RawMutex> {
    /// Serialises callers and holds the last sequence number handed out.
    caller: Mutex<M, u32>,
    requests: Channel<M, Request, 1>,
    responses: Signal<M, (u32, Result<Response, ErrorCode>)>,
    monitor: UpdateMonitor,
}

impl<M: RawMutex> ControlPort<M> {
    pub const fn new() -> Self {
        Self {
            caller: Mutex::new(0),
            requests: Channel::new(),
            responses: Signal::new(),
            monitor: UpdateMonitor::new(),
        }
    }

    /// Sends `command` to the service and waits for its answer.
    ///
    /// Concurrent callers are served one after another. Dropping the returned
    /// future is safe: the command may still run, but its answer is never
    /// handed to a later caller.
    pub async fn call(&self, command: Command) -> Result<Response, ErrorCode> {
        let mut last = self.caller.lock().await;
        *last = last.wrapping_add(1);
        let seq = *last;
        self.responses.reset();
        self.requests.send(Request { seq, command }).await;
        loop {
            let (answered, res) = self.responses.wait().await;
            if answered == seq {
                return res;
            }
            log::debug!("ektf2k::control discarding answer to abandoned request {answered}");
        }
    }

    /// Cancellation and progress of a running update. Usable while the
    /// service is busy flashing.
    pub fn monitor(&self) -> &UpdateMonitor {
        &self.monitor
    }
}

impl<M: RawMutex> Default for ControlPort<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the [`Service`] has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The controller asserted data-ready.
    Ready,
    /// A reconciliation period passed without a ready event.
    Tick,
    /// A host control request.
    Control(Request),
}

/// Owns a [`Controller`] and dispatches events to it.
pub struct Service<'p, 'a, M: RawMutex, T, D> {
    controller: Controller<'a, T, D>,
    port: &'p ControlPort<M>,
}

impl<'p, 'a, M, T, D> Service<'p, 'a, M, T, D>
where
    M: RawMutex,
    T: Transport,
    D: DelayNs,
{
    /// Creates a new `Service` for a controller that has been brought up.
    pub fn new(controller: Controller<'a, T, D>, port: &'p ControlPort<M>) -> Self {
        Self { controller, port }
    }

    pub fn controller(&mut self) -> &mut Controller<'a, T, D> {
        &mut self.controller
    }

    pub fn into_inner(self) -> Controller<'a, T, D> {
        self.controller
    }

    /// Waits for the next event.
    pub async fn next_event(&mut self) -> Event {
        if self.controller.is_update_locked() || self.controller.is_suspended() {
            return Event::Control(self.port.requests.receive().await);
        }
        let ready = self.controller.wait_ready(RECONCILE_PERIOD);
        match select(ready, self.port.requests.receive()).await {
            Either::First(Ok(true)) => Event::Ready,
            Either::First(Ok(false)) => Event::Tick,
            Either::First(Err(err)) => {
                log::warn!("ektf2k::service ready wait failed: {err:?}");
                Event::Tick
            }
            Either::Second(request) => Event::Control(request),
        }
    }

    /// Handles one event to completion.
    pub async fn handle<S: TouchSink>(&mut self, event: Event, sink: &mut S) {
        match event {
            Event::Ready => {
                let outcome = self.controller.handle_ready(sink).await;
                log::trace!("ektf2k::service ready: {outcome:?}");
            }
            Event::Tick => {
                let outcome = self.controller.reconcile_tick().await;
                log::debug!("ektf2k::service tick: {outcome:?}");
            }
            Event::Control(Request { seq, command }) => {
                let res = self
                    .controller
                    .control(command, &self.port.monitor)
                    .await
                    .map_err(|err| {
                        log::warn!("ektf2k::service {command:?} failed: {err:?}");
                        err.code()
                    });
                self.port.responses.signal((seq, res));
            }
        }
    }

    /// Waits for and handles a single event.
    pub async fn poll_once<S: TouchSink>(&mut self, sink: &mut S) {
        let event = self.next_event().await;
        self.handle(event, sink).await;
    }

    /// Dispatches events forever.
    pub async fn run<S: TouchSink>(&mut self, sink: &mut S) -> ! {
        log::info!("ektf2k::service running");
        loop {
            self.poll_once(sink).await;
        }
    }
}
