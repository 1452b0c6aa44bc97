//! The byte transport the controller is reached through, and its I2C binding.

use core::fmt::{self, Debug};

use embassy_futures::select::{select, Either};
use embassy_time::Duration;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

/// Default 7-bit address of the EKTF2K family.
pub const I2C_ADDRESS: u8 = 0x15;

/// How long the reset line is held low by [`I2cTransport::pulse_reset`].
const RESET_HOLD_US: u32 = 1_000;

/// Half-duplex command/response access to the controller.
///
/// Implementations only move bytes and drive the two side-band lines. All
/// protocol timing beyond the reset pulse itself is handled by the driver.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// The error reported by the underlying bus or pins.
    type Error: Debug;

    /// Writes `bytes` in one transfer and returns how many were accepted.
    async fn send(&mut self, bytes: &[u8]) -> Result<usize, Self::Error>;

    /// Reads up to `buf.len()` bytes, giving up after `timeout`.
    ///
    /// Returns the number of bytes read. A timeout is reported as `Ok(0)`.
    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error>;

    /// Waits until the data-ready line is asserted or `timeout` elapses.
    ///
    /// Returns `true` if the line was asserted.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<bool, Self::Error>;

    /// Pulses the reset line low and releases it.
    async fn pulse_reset(&mut self) -> Result<(), Self::Error>;

    /// Samples the data-ready line without waiting.
    fn is_ready(&mut self) -> Result<bool, Self::Error>;
}

/// An error of the bundled I2C binding.
pub enum BusError<I2CERR, PINERR> {
    /// An error occurred on the I2C bus.
    I2c(I2CERR),
    /// An error occurred on the interrupt or reset pin.
    Pin(PINERR),
}

impl<I2CERR: Debug, PINERR: Debug> Debug for BusError<I2CERR, PINERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I2c(err) => write!(f, "I2c({err:?})"),
            Self::Pin(err) => write!(f, "Pin({err:?})"),
        }
    }
}

/// A [`Transport`] over an async I2C bus, an active-low interrupt line and
/// an active-low reset line.
pub struct I2cTransport<I2C, INT, RST, D> {
    i2c: I2C,
    int: INT,
    rst: RST,
    delay: D,
    address: u8,
}

impl<I2C, INT, RST, D, I2CERR, PINERR> I2cTransport<I2C, INT, RST, D>
where
    I2CERR: Debug,
    PINERR: Debug,
    I2C: I2c<SevenBitAddress, Error = I2CERR>,
    INT: InputPin<Error = PINERR> + Wait,
    RST: OutputPin<Error = PINERR>,
    D: DelayNs,
{
    /// Creates a new `I2cTransport` at the default address.
    ///
    /// # Arguments
    ///
    /// * `i2c` - An I2C peripheral that implements `embedded-hal-async::i2c::I2c`.
    /// * `int` - The interrupt (data-ready) input pin, asserted low.
    /// * `rst` - The reset output pin, asserted low.
    /// * `delay` - A delay source used for read timeouts and the reset pulse.
    pub fn new(i2c: I2C, int: INT, rst: RST, delay: D) -> Self {
        Self::with_address(i2c, int, rst, delay, I2C_ADDRESS)
    }

    /// Creates a new `I2cTransport` at a non-default address.
    pub fn with_address(i2c: I2C, int: INT, rst: RST, delay: D, address: u8) -> Self {
        Self {
            i2c,
            int,
            rst,
            delay,
            address,
        }
    }

    /// Releases the owned peripherals.
    pub fn release(self) -> (I2C, INT, RST, D) {
        (self.i2c, self.int, self.rst, self.delay)
    }
}

impl<I2C, INT, RST, D, I2CERR, PINERR> Transport for I2cTransport<I2C, INT, RST, D>
where
    I2CERR: Debug,
    PINERR: Debug,
    I2C: I2c<SevenBitAddress, Error = I2CERR>,
    INT: InputPin<Error = PINERR> + Wait,
    RST: OutputPin<Error = PINERR>,
    D: DelayNs,
{
    type Error = BusError<I2CERR, PINERR>;

    async fn send(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        self.i2c
            .write(self.address, bytes)
            .await
            .map_err(BusError::I2c)?;
        Ok(bytes.len())
    }

    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        let len = buf.len();
        let read = self.i2c.read(self.address, buf);
        let timer = self.delay.delay_us(timeout.as_micros() as u32);
        match select(read, timer).await {
            Either::First(res) => res.map(|_| len).map_err(BusError::I2c),
            Either::Second(_) => {
                log::warn!("ektf2k::recv timed out after {}ms", timeout.as_millis());
                Ok(0)
            }
        }
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<bool, Self::Error> {
        let ready = self.int.wait_for_low();
        let timer = self.delay.delay_us(timeout.as_micros() as u32);
        match select(ready, timer).await {
            Either::First(res) => res.map(|_| true).map_err(BusError::Pin),
            Either::Second(_) => Ok(false),
        }
    }

    async fn pulse_reset(&mut self) -> Result<(), Self::Error> {
        self.rst.set_low().map_err(BusError::Pin)?;
        self.delay.delay_us(RESET_HOLD_US).await;
        self.rst.set_high().map_err(BusError::Pin)
    }

    fn is_ready(&mut self) -> Result<bool, Self::Error> {
        self.int.is_low().map_err(BusError::Pin)
    }
}
