//! Scripted transport and recording delay for unit tests.

extern crate std;

use std::collections::VecDeque;
use std::vec::Vec;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;

use crate::firmware::IMAGE_SIZE;
use crate::packet::{TouchPoint, TouchReport};
use crate::service::TouchSink;
use crate::transport::Transport;

/// A hello packet from running firmware.
pub(crate) const NORMAL_HELLO: [u8; 8] = [0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Send(Vec<u8>),
    Recv(usize),
    WaitReady,
    Reset,
}

#[derive(Debug)]
pub(crate) struct MockError;

/// Replays scripted reads and ready results, and records every operation.
///
/// Reads beyond the script fail. Ready waits beyond the script return
/// `ready_default`, or never complete when it is `None`.
pub(crate) struct MockTransport {
    pub ops: Vec<Op>,
    reads: VecDeque<Vec<u8>>,
    ready: VecDeque<bool>,
    pub ready_default: Option<bool>,
    pub ready_level: bool,
    pub fail_sends: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            reads: VecDeque::new(),
            ready: VecDeque::new(),
            ready_default: Some(true),
            ready_level: true,
            fail_sends: false,
        }
    }

    pub fn push_read(&mut self, bytes: &[u8]) {
        self.reads.push_back(bytes.to_vec());
    }

    pub fn push_ready(&mut self, ready: bool) {
        self.ready.push_back(ready);
    }

    /// Every buffer handed to `send`, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Send(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    type Error = MockError;

    async fn send(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        self.ops.push(Op::Send(bytes.to_vec()));
        if self.fail_sends {
            return Err(MockError);
        }
        Ok(bytes.len())
    }

    async fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Self::Error> {
        self.ops.push(Op::Recv(buf.len()));
        let data = self.reads.pop_front().ok_or(MockError)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<bool, Self::Error> {
        self.ops.push(Op::WaitReady);
        match self.ready.pop_front().or(self.ready_default) {
            Some(ready) => Ok(ready),
            None => core::future::pending().await,
        }
    }

    async fn pulse_reset(&mut self) -> Result<(), Self::Error> {
        self.ops.push(Op::Reset);
        Ok(())
    }

    fn is_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.ready_level)
    }
}

/// Completes immediately and records every requested delay in milliseconds.
#[derive(Default)]
pub(crate) struct MockDelay {
    pub delays: Vec<u32>,
}

impl DelayNs for MockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.delays.push(ns / 1_000_000);
    }

    async fn delay_us(&mut self, us: u32) {
        self.delays.push(us / 1_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }
}

/// Collects reports and frame boundaries.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub reports: Vec<Vec<TouchPoint>>,
    pub syncs: usize,
}

impl TouchSink for RecordingSink {
    fn report(&mut self, report: &TouchReport) {
        self.reports.push(report.points().to_vec());
    }

    fn sync(&mut self) {
        self.syncs += 1;
    }
}

/// A full-size image whose bytes differ from page to page.
pub(crate) fn test_image() -> Vec<u8> {
    (0..IMAGE_SIZE).map(|i| (i % 251) as u8).collect()
}
