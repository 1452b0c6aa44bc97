//! Chip identification: the hello packet and the capability probes.

use embedded_hal_async::delay::DelayNs;

use crate::error::{Error, TransportError};
use crate::link::Link;
use crate::transport::Transport;

/// Settle after a plain hardware reset before the hello packet arrives.
pub(crate) const HW_RESET_SETTLE_MS: u32 = 5;

const HELLO_LEN: usize = 8;
const RECOVERY_HELLO: [u8; 4] = [0x55, 0x55, 0x80, 0x80];
const FAMILY_A_HELLO_TAIL: [u8; 2] = [0x04, 0x21];
const FAMILY_A_VERSION_MAJOR: u8 = 0x55;

const CMD_FW_VERSION: [u8; 4] = [0x53, 0x00, 0x00, 0x01];
const CMD_FW_ID: [u8; 4] = [0x53, 0xF0, 0x00, 0x01];
const CMD_BOOTCODE_VERSION: [u8; 4] = [0x53, 0x01, 0x00, 0x01];
const CMD_X_RESOLUTION: [u8; 4] = [0x53, 0x60, 0x00, 0x00];
const CMD_Y_RESOLUTION: [u8; 4] = [0x53, 0x63, 0x00, 0x00];

/// The two firmware-incompatible controller generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChipFamily {
    /// 2127-class parts. Assumed until the controller says otherwise.
    #[default]
    A,
    /// 2227-class parts.
    B,
}

impl ChipFamily {
    /// The command that switches the controller into ISP mode.
    pub(crate) fn isp_command(self) -> [u8; 4] {
        match self {
            Self::A => [0x45, 0x49, 0x41, 0x50],
            Self::B => [0x54, 0x00, 0x12, 0x34],
        }
    }

    pub(crate) fn mode_register(self) -> u8 {
        match self {
            Self::A => 0x5C,
            Self::B => 0x56,
        }
    }

    pub(crate) fn talking_register(self) -> u8 {
        match self {
            Self::A => 0x5D,
            Self::B => 0x57,
        }
    }

    /// Whether the family must stop scanning while it is being reconfigured.
    pub(crate) fn pauses_scan(self) -> bool {
        self == Self::B
    }
}

/// What the controller reported about itself during the last probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChipIdentity {
    /// Detected controller family.
    pub family: ChipFamily,
    /// Running firmware version.
    pub firmware_version: u16,
    /// Firmware id. Zero means a blank or corrupt part.
    pub firmware_id: u16,
    /// Bootcode version.
    pub bootcode_version: u16,
    /// Native sensor resolution along x.
    pub x_resolution: u16,
    /// Native sensor resolution along y.
    pub y_resolution: u16,
}

impl ChipIdentity {
    /// A zeroed identity, used when the controller could not be probed.
    pub fn unknown(family: ChipFamily) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    /// Returns `true` if the firmware id marks a blank or corrupt part.
    pub fn is_blank(&self) -> bool {
        self.firmware_id == 0
    }
}

/// Classification of the hello packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloStatus {
    /// Normal firmware is running.
    Normal,
    /// The bootloader is waiting for a firmware image.
    Recovery,
    /// The controller never asserted its ready line.
    Timeout,
}

/// The result of [`Link::identify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    /// How the last hello packet was classified.
    pub hello: HelloStatus,
    /// The probed identity, zeroed unless the hello was normal.
    pub identity: ChipIdentity,
}

impl Identification {
    /// Returns `true` if the controller has to be flashed without the ISP
    /// entry handshake.
    pub fn needs_recovery(&self) -> bool {
        match self.hello {
            HelloStatus::Normal => self.identity.firmware_version == 0,
            HelloStatus::Recovery | HelloStatus::Timeout => true,
        }
    }
}

/// Decodes a nibble-packed 16-bit value from a capability response.
pub fn decode_version(response: [u8; 4]) -> u16 {
    let major = ((response[1] & 0x0F) << 4) | ((response[2] & 0xF0) >> 4);
    let minor = ((response[2] & 0x0F) << 4) | ((response[3] & 0xF0) >> 4);
    u16::from_be_bytes([major, minor])
}

/// Decodes a 12-bit resolution from a capability response.
pub fn decode_resolution(response: [u8; 4]) -> u16 {
    response[2] as u16 | (((response[3] & 0xF0) as u16) << 4)
}

/// Classifies a hello packet. A recovery hello with the family A trailer also
/// updates `family`.
pub fn classify_hello(hello: &[u8; HELLO_LEN], family: &mut ChipFamily) -> HelloStatus {
    if hello[..4] != RECOVERY_HELLO {
        return HelloStatus::Normal;
    }
    if hello[6..] == FAMILY_A_HELLO_TAIL {
        *family = ChipFamily::A;
    }
    HelloStatus::Recovery
}

impl<T, D> Link<T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Waits for and classifies the hello packet.
    pub(crate) async fn probe_hello(
        &mut self,
        family: &mut ChipFamily,
    ) -> Result<HelloStatus, TransportError<T::Error>> {
        match self.poll_ready().await {
            Ok(()) => {}
            Err(TransportError::ReadyTimeout) => {
                log::warn!("ektf2k::probe_hello no hello packet");
                return Ok(HelloStatus::Timeout);
            }
            Err(err) => return Err(err),
        }

        let mut hello = [0u8; HELLO_LEN];
        if let Err(err) = self.recv(&mut hello).await {
            log::debug!("ektf2k::probe_hello retrying read after {err:?}");
            self.recv(&mut hello).await?;
        }
        log::trace!("ektf2k::probe_hello {hello:02x?}");

        let status = classify_hello(&hello, family);
        if status == HelloStatus::Recovery {
            log::info!("ektf2k::probe_hello controller is in recovery mode");
        }
        Ok(status)
    }

    /// Reads firmware version, id, bootcode version and sensor resolution.
    pub(crate) async fn probe_capabilities(&mut self) -> Result<ChipIdentity, Error<T::Error>> {
        let version = self.request(CMD_FW_VERSION).await?;
        let firmware_version = decode_version(version);
        let family = if (firmware_version >> 8) as u8 == FAMILY_A_VERSION_MAJOR {
            ChipFamily::A
        } else {
            ChipFamily::B
        };
        let firmware_id = decode_version(self.request(CMD_FW_ID).await?);
        let bootcode_version = decode_version(self.request(CMD_BOOTCODE_VERSION).await?);
        let x_resolution = decode_resolution(self.request(CMD_X_RESOLUTION).await?);
        let y_resolution = decode_resolution(self.request(CMD_Y_RESOLUTION).await?);

        let identity = ChipIdentity {
            family,
            firmware_version,
            firmware_id,
            bootcode_version,
            x_resolution,
            y_resolution,
        };
        log::info!(
            "ektf2k::probe_capabilities fw 0x{:04x} id 0x{:04x} bootcode 0x{:04x} res {}x{}",
            identity.firmware_version,
            identity.firmware_id,
            identity.bootcode_version,
            identity.x_resolution,
            identity.y_resolution
        );
        Ok(identity)
    }

    /// Resets the controller and waits for its hello, up to `retries` times
    /// while the hello times out, then probes its capabilities.
    ///
    /// Transport failures on every attempt, or during the capability probe,
    /// yield [`Error::ChipAbsent`].
    pub(crate) async fn identify(
        &mut self,
        family: &mut ChipFamily,
        retries: u8,
    ) -> Result<Identification, Error<T::Error>> {
        let mut hello = None;
        for attempt in 1..=retries.max(1) {
            let res = match self.reset(HW_RESET_SETTLE_MS).await {
                Ok(()) => self.probe_hello(family).await,
                Err(err) => Err(err),
            };
            match res {
                Ok(HelloStatus::Timeout) => hello = Some(HelloStatus::Timeout),
                Ok(status) => {
                    hello = Some(status);
                    break;
                }
                Err(err) => {
                    log::warn!("ektf2k::identify attempt {attempt} failed: {err:?}");
                    hello = None;
                }
            }
        }
        self.settle_ms(10).await;

        let hello = hello.ok_or(Error::ChipAbsent)?;
        let identity = match hello {
            HelloStatus::Normal => {
                let identity = self.probe_capabilities().await.map_err(|err| {
                    log::error!("ektf2k::identify capability probe failed: {err:?}");
                    Error::ChipAbsent
                })?;
                *family = identity.family;
                if identity.firmware_version == 0 {
                    log::error!("ektf2k::identify firmware version 0, last update failed");
                }
                identity
            }
            HelloStatus::Recovery | HelloStatus::Timeout => ChipIdentity::unknown(*family),
        };
        Ok(Identification { hello, identity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDelay, MockTransport, Op, NORMAL_HELLO};
    use embassy_futures::block_on;

    fn push_capabilities(transport: &mut MockTransport, version: [u8; 4], id: [u8; 4]) {
        transport.push_read(&version);
        transport.push_read(&id);
        transport.push_read(&[0x52, 0x00, 0x10, 0x00]);
        transport.push_read(&[0x52, 0x00, 0x40, 0x20]);
        transport.push_read(&[0x52, 0x00, 0xC0, 0x30]);
    }

    #[test]
    fn version_is_nibble_packed() {
        assert_eq!(decode_version([0x52, 0x05, 0x51, 0x20]), 0x5512);
        assert_eq!(decode_version([0x52, 0xF1, 0x23, 0x4F]), 0x1234);
        assert_eq!(decode_version([0x52, 0x00, 0x00, 0x00]), 0);
    }

    #[test]
    fn resolution_uses_twelve_bits() {
        assert_eq!(decode_resolution([0x52, 0x00, 0x40, 0x20]), 576);
        assert_eq!(decode_resolution([0x52, 0x00, 0xC0, 0x30]), 960);
        assert_eq!(decode_resolution([0x52, 0xFF, 0xFF, 0xFF]), 0xFFF);
    }

    #[test]
    fn hello_classification() {
        let mut family = ChipFamily::B;
        assert_eq!(classify_hello(&NORMAL_HELLO, &mut family), HelloStatus::Normal);
        assert_eq!(family, ChipFamily::B);

        let recovery = [0x55, 0x55, 0x80, 0x80, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(classify_hello(&recovery, &mut family), HelloStatus::Recovery);
        assert_eq!(family, ChipFamily::B);

        let recovery_a = [0x55, 0x55, 0x80, 0x80, 0x00, 0x00, 0x04, 0x21];
        assert_eq!(classify_hello(&recovery_a, &mut family), HelloStatus::Recovery);
        assert_eq!(family, ChipFamily::A);
    }

    #[test]
    fn identify_probes_capabilities_after_normal_hello() {
        let mut transport = MockTransport::new();
        transport.push_read(&NORMAL_HELLO);
        push_capabilities(
            &mut transport,
            [0x52, 0x01, 0x02, 0x30],
            [0x52, 0x00, 0x2A, 0xB0],
        );
        let mut link = Link::new(transport, MockDelay::default());
        let mut family = ChipFamily::A;

        let ident = block_on(link.identify(&mut family, 3)).unwrap();
        assert_eq!(ident.hello, HelloStatus::Normal);
        assert!(!ident.needs_recovery());
        assert_eq!(family, ChipFamily::B);
        assert_eq!(
            ident.identity,
            ChipIdentity {
                family: ChipFamily::B,
                firmware_version: 0x1023,
                firmware_id: 0x02AB,
                bootcode_version: 0x0100,
                x_resolution: 576,
                y_resolution: 960,
            }
        );

        let (transport, _) = link.release();
        assert_eq!(transport.sent(), [
            CMD_FW_VERSION.to_vec(),
            CMD_FW_ID.to_vec(),
            CMD_BOOTCODE_VERSION.to_vec(),
            CMD_X_RESOLUTION.to_vec(),
            CMD_Y_RESOLUTION.to_vec(),
        ]);
    }

    #[test]
    fn version_major_0x55_selects_family_a() {
        let mut transport = MockTransport::new();
        transport.push_read(&NORMAL_HELLO);
        push_capabilities(
            &mut transport,
            [0x52, 0x05, 0x51, 0x20],
            [0x52, 0x00, 0x01, 0x00],
        );
        let mut link = Link::new(transport, MockDelay::default());
        let mut family = ChipFamily::B;

        let ident = block_on(link.identify(&mut family, 3)).unwrap();
        assert_eq!(ident.identity.family, ChipFamily::A);
        assert_eq!(family, ChipFamily::A);
    }

    #[test]
    fn zero_version_needs_recovery() {
        let mut transport = MockTransport::new();
        transport.push_read(&NORMAL_HELLO);
        push_capabilities(
            &mut transport,
            [0x52, 0x00, 0x00, 0x00],
            [0x52, 0x00, 0x01, 0x00],
        );
        let mut link = Link::new(transport, MockDelay::default());

        let ident = block_on(link.identify(&mut ChipFamily::A, 3)).unwrap();
        assert_eq!(ident.hello, HelloStatus::Normal);
        assert!(ident.needs_recovery());
    }

    #[test]
    fn hello_timeouts_are_retried_then_reported() {
        let mut transport = MockTransport::new();
        transport.push_ready(false);
        transport.push_ready(false);
        transport.push_ready(false);
        let mut link = Link::new(transport, MockDelay::default());

        let ident = block_on(link.identify(&mut ChipFamily::B, 3)).unwrap();
        assert_eq!(ident.hello, HelloStatus::Timeout);
        assert!(ident.needs_recovery());
        assert_eq!(ident.identity, ChipIdentity::unknown(ChipFamily::B));

        let (transport, _) = link.release();
        let resets = transport.ops.iter().filter(|op| **op == Op::Reset).count();
        assert_eq!(resets, 3);
    }

    #[test]
    fn silent_bus_is_chip_absent() {
        // No scripted reads: every hello read fails.
        let mut link = Link::new(MockTransport::new(), MockDelay::default());
        let res = block_on(link.identify(&mut ChipFamily::A, 3));
        assert!(matches!(res, Err(Error::ChipAbsent)));
    }

    #[test]
    fn capability_failure_is_chip_absent() {
        let mut transport = MockTransport::new();
        transport.push_read(&NORMAL_HELLO);
        transport.push_read(&[0x52, 0x00, 0x00, 0x01]);
        let mut link = Link::new(transport, MockDelay::default());
        let res = block_on(link.identify(&mut ChipFamily::A, 3));
        assert!(matches!(res, Err(Error::ChipAbsent)));
    }
}
