//! Runs the driver against a simulated EKTF2K on the host.
//!
//! The simulated panel answers the identification probes, keeps the mode
//! registers and plays back a short swipe. Touch reports arrive on a channel
//! and a control request is served in between.

use std::collections::VecDeque;
use std::convert::Infallible;

use embassy_futures::{block_on, join::join};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use ektf2k_touch_async::{
    Command, Config, ControlPort, Controller, Service, TouchReport, Transport,
};

static PORT: ControlPort<CriticalSectionRawMutex> = ControlPort::new();
static REPORTS: Channel<CriticalSectionRawMutex, TouchReport, 8> = Channel::new();

const HELLO: [u8; 8] = [0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x00, 0x00];

struct SimulatedPanel {
    outbox: VecDeque<Vec<u8>>,
    frames: VecDeque<[u8; 12]>,
    modes: [u8; 256],
}

impl SimulatedPanel {
    fn new() -> Self {
        let mut frames = VecDeque::new();
        for step in 0..4u16 {
            let x = 100 + step * 80;
            let y = 200 + step * 120;
            let mut frame = [0u8; 12];
            frame[0] = 0x5A;
            frame[1] = (((x >> 8) as u8) << 4) | ((y >> 8) as u8 & 0x0F);
            frame[2] = x as u8;
            frame[3] = y as u8;
            frame[7] = 0x01;
            frames.push_back(frame);
        }
        // Lift-off.
        let mut lift = [0u8; 12];
        lift[0] = 0x5A;
        frames.push_back(lift);

        Self {
            outbox: VecDeque::new(),
            frames,
            modes: [0; 256],
        }
    }

    fn answer(&mut self, bytes: &[u8]) {
        let response = match *bytes {
            [0x53, 0x00, _, _] => [0x52, 0x01, 0x02, 0x30],
            [0x53, 0xF0, _, _] => [0x52, 0x00, 0x2A, 0xB0],
            [0x53, 0x01, _, _] => [0x52, 0x00, 0x10, 0x00],
            [0x53, 0x60, _, _] => [0x52, 0x00, 0x40, 0x20],
            [0x53, 0x63, _, _] => [0x52, 0x00, 0xC0, 0x30],
            [0x53, 0x0A, _, _] => [0x52, 0x0A, 0x00, 0x01],
            [0x53, reg, _, _] => [0x52, reg, self.modes[reg as usize], 0x01],
            [0x54, reg, value, 0x01] => {
                self.modes[reg as usize] = value;
                return;
            }
            _ => return,
        };
        self.outbox.push_back(response.to_vec());
    }
}

impl Transport for SimulatedPanel {
    type Error = Infallible;

    async fn send(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        self.answer(bytes);
        Ok(bytes.len())
    }

    async fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Self::Error> {
        let Some(data) = self.outbox.pop_front() else {
            return Ok(0);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<bool, Self::Error> {
        if self.outbox.is_empty() {
            match self.frames.pop_front() {
                Some(frame) => self.outbox.push_back(frame.to_vec()),
                // The swipe is over. Stay quiet so control requests get through.
                None => core::future::pending().await,
            }
        }
        Ok(true)
    }

    async fn pulse_reset(&mut self) -> Result<(), Self::Error> {
        self.outbox.clear();
        self.outbox.push_back(HELLO.to_vec());
        Ok(())
    }

    fn is_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.outbox.is_empty())
    }
}

/// Settles are instantaneous in simulation.
struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

fn main() {
    let mut controller = Controller::new(SimulatedPanel::new(), NoDelay, Config::default());
    block_on(async {
        match controller.bring_up().await {
            Ok(_) => println!("identity: {:?}", controller.identity()),
            Err(err) => println!("bring-up failed: {err:?}"),
        }

        let mut service = Service::new(controller, &PORT);
        let mut sender = REPORTS.sender();
        for _ in 0..5 {
            service.poll_once(&mut sender).await;
        }
        while let Ok(report) = REPORTS.try_receive() {
            println!("touch: {:?}", report.points());
        }

        let (_, vendor) = join(service.poll_once(&mut sender), PORT.call(Command::Vendor)).await;
        println!("vendor: {vendor:?}");
    });
}
