//! Framed access to a [`Transport`]: length checks, ready polling and settles.

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;

use crate::error::{Error, ProtocolError, TransportError};
use crate::transport::Transport;

/// Upper bound for one ready poll (10 polls of 50 ms).
pub(crate) const READY_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for a single read once the controller is ready.
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// First byte of every command response.
pub(crate) const RESPONSE_HEADER: u8 = 0x52;

/// Exclusive, checked access to the transport plus the delay source used for
/// protocol settles.
pub(crate) struct Link<T, D> {
    pub(crate) transport: T,
    delay: D,
}

impl<T, D> Link<T, D>
where
    T: Transport,
    D: DelayNs,
{
    pub(crate) fn new(transport: T, delay: D) -> Self {
        Self { transport, delay }
    }

    pub(crate) fn release(self) -> (T, D) {
        (self.transport, self.delay)
    }

    /// Writes all of `bytes` or fails with a short write.
    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError<T::Error>> {
        let written = self
            .transport
            .send(bytes)
            .await
            .map_err(TransportError::Bus)?;
        if written != bytes.len() {
            return Err(TransportError::ShortWrite {
                expected: bytes.len(),
                written,
            });
        }
        Ok(())
    }

    /// Fills all of `buf` or fails with a short read.
    pub(crate) async fn recv(&mut self, buf: &mut [u8]) -> Result<(), TransportError<T::Error>> {
        let read = self
            .transport
            .recv(buf, RECV_TIMEOUT)
            .await
            .map_err(TransportError::Bus)?;
        if read != buf.len() {
            return Err(TransportError::ShortRead {
                expected: buf.len(),
                read,
            });
        }
        Ok(())
    }

    /// Waits for the data-ready line within [`READY_TIMEOUT`].
    pub(crate) async fn poll_ready(&mut self) -> Result<(), TransportError<T::Error>> {
        let ready = self
            .transport
            .wait_ready(READY_TIMEOUT)
            .await
            .map_err(TransportError::Bus)?;
        if !ready {
            log::debug!("ektf2k::poll_ready timed out");
            return Err(TransportError::ReadyTimeout);
        }
        Ok(())
    }

    /// Sends a 4-byte command and returns its 4-byte response.
    pub(crate) async fn request(&mut self, cmd: [u8; 4]) -> Result<[u8; 4], Error<T::Error>> {
        self.send(&cmd).await?;
        self.poll_ready().await?;
        let mut response = [0u8; 4];
        self.recv(&mut response).await?;
        log::trace!("ektf2k::request {cmd:02x?} -> {response:02x?}");
        if response[0] != RESPONSE_HEADER {
            return Err(ProtocolError::UnexpectedHeader(response[0]).into());
        }
        Ok(response)
    }

    /// Pulses the reset line, then waits `settle_ms` for the controller to boot.
    pub(crate) async fn reset(&mut self, settle_ms: u32) -> Result<(), TransportError<T::Error>> {
        self.transport
            .pulse_reset()
            .await
            .map_err(TransportError::Bus)?;
        self.settle_ms(settle_ms).await;
        Ok(())
    }

    pub(crate) async fn settle_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }
}
