//! Reapplies the operating and talking modes after the controller reset.

use embedded_hal_async::delay::DelayNs;

use crate::error::{Error, TransportError};
use crate::identity::ChipFamily;
use crate::link::Link;
use crate::transport::Transport;

const CMD_READ: u8 = 0x53;
const CMD_WRITE: u8 = 0x54;
const SCAN_STOP: [u8; 6] = [0x54, 0x9F, 0x01, 0x00, 0x00, 0x01];
const SCAN_START: [u8; 6] = [0x54, 0x9F, 0x00, 0x00, 0x00, 0x01];
const SCAN_RESTART_DELAY_MS: u32 = 10;

/// The configuration that must survive controller resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredConfig {
    pub operating_mode: u8,
    pub talking_mode: u8,
}

/// A persistent controller setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    OperatingMode,
    TalkingMode,
}

impl Setting {
    fn register(self, family: ChipFamily) -> u8 {
        match self {
            Self::OperatingMode => family.mode_register(),
            Self::TalkingMode => family.talking_register(),
        }
    }
}

/// How one setting was brought in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The readback matched after the first write.
    Matched,
    /// The readback differed or failed, so the value was written once more.
    Rewritten,
    /// Writing the value failed.
    Failed,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub operating_mode: Applied,
    pub talking_mode: Applied,
}

impl<T, D> Link<T, D>
where
    T: Transport,
    D: DelayNs,
{
    pub(crate) async fn write_setting(
        &mut self,
        family: ChipFamily,
        setting: Setting,
        value: u8,
    ) -> Result<(), TransportError<T::Error>> {
        self.send(&[CMD_WRITE, setting.register(family), value, 0x01])
            .await
    }

    pub(crate) async fn read_setting(
        &mut self,
        family: ChipFamily,
        setting: Setting,
    ) -> Result<u8, Error<T::Error>> {
        let response = self
            .request([CMD_READ, setting.register(family), 0x00, 0x01])
            .await?;
        Ok(response[2])
    }

    pub(crate) async fn set_scanning(&mut self, enabled: bool) -> Result<(), TransportError<T::Error>> {
        self.send(if enabled { &SCAN_START } else { &SCAN_STOP })
            .await
    }

    /// Writes `desired`, verifies it by reading back, and writes once more on
    /// mismatch. Errors are logged, never returned.
    pub(crate) async fn reconcile(&mut self, family: ChipFamily, desired: DesiredConfig) -> SyncReport {
        if family.pauses_scan() {
            if let Err(err) = self.set_scanning(false).await {
                log::warn!("ektf2k::reconcile scan stop failed: {err:?}");
            }
        }

        let report = SyncReport {
            operating_mode: self
                .apply(family, Setting::OperatingMode, desired.operating_mode)
                .await,
            talking_mode: self
                .apply(family, Setting::TalkingMode, desired.talking_mode)
                .await,
        };

        if family.pauses_scan() {
            self.settle_ms(SCAN_RESTART_DELAY_MS).await;
            if let Err(err) = self.set_scanning(true).await {
                log::warn!("ektf2k::reconcile scan start failed: {err:?}");
            }
        }
        log::debug!("ektf2k::reconcile {report:?}");
        report
    }

    async fn apply(&mut self, family: ChipFamily, setting: Setting, value: u8) -> Applied {
        if let Err(err) = self.write_setting(family, setting, value).await {
            log::warn!("ektf2k::reconcile {setting:?} write failed: {err:?}");
        }
        match self.read_setting(family, setting).await {
            Ok(current) if current == value => return Applied::Matched,
            Ok(current) => {
                log::info!("ektf2k::reconcile {setting:?} is {current}, want {value}");
            }
            Err(err) => log::warn!("ektf2k::reconcile {setting:?} readback failed: {err:?}"),
        }
        match self.write_setting(family, setting, value).await {
            Ok(()) => Applied::Rewritten,
            Err(err) => {
                log::error!("ektf2k::reconcile {setting:?} rewrite failed: {err:?}");
                Applied::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec;

    use super::*;
    use crate::mock::{MockDelay, MockTransport};
    use embassy_futures::block_on;

    const DESIRED: DesiredConfig = DesiredConfig {
        operating_mode: 0x01,
        talking_mode: 0x00,
    };

    #[test]
    fn mismatch_is_written_exactly_once_more() {
        let mut transport = MockTransport::new();
        transport.push_read(&[0x52, 0x56, 0x07, 0x01]);
        transport.push_read(&[0x52, 0x57, 0x00, 0x01]);
        let mut link = Link::new(transport, MockDelay::default());

        let report = block_on(link.reconcile(ChipFamily::B, DESIRED));
        assert_eq!(
            report,
            SyncReport {
                operating_mode: Applied::Rewritten,
                talking_mode: Applied::Matched,
            }
        );

        let (transport, delay) = link.release();
        assert_eq!(
            transport.sent(),
            vec![
                SCAN_STOP.to_vec(),
                vec![0x54, 0x56, 0x01, 0x01],
                vec![0x53, 0x56, 0x00, 0x01],
                vec![0x54, 0x56, 0x01, 0x01],
                vec![0x54, 0x57, 0x00, 0x01],
                vec![0x53, 0x57, 0x00, 0x01],
                SCAN_START.to_vec(),
            ]
        );
        assert_eq!(delay.delays, [10]);
    }

    #[test]
    fn family_a_uses_its_registers_without_scan_control() {
        let mut transport = MockTransport::new();
        transport.push_read(&[0x52, 0x5C, 0x01, 0x01]);
        transport.push_read(&[0x52, 0x5D, 0x00, 0x01]);
        let mut link = Link::new(transport, MockDelay::default());

        let report = block_on(link.reconcile(ChipFamily::A, DESIRED));
        assert_eq!(report.operating_mode, Applied::Matched);
        assert_eq!(report.talking_mode, Applied::Matched);

        let (transport, delay) = link.release();
        assert_eq!(
            transport.sent(),
            vec![
                vec![0x54, 0x5C, 0x01, 0x01],
                vec![0x53, 0x5C, 0x00, 0x01],
                vec![0x54, 0x5D, 0x00, 0x01],
                vec![0x53, 0x5D, 0x00, 0x01],
            ]
        );
        assert!(delay.delays.is_empty());
    }

    #[test]
    fn failed_readback_is_rewritten_without_escalation() {
        let mut link = Link::new(MockTransport::new(), MockDelay::default());

        let report = block_on(link.reconcile(ChipFamily::A, DESIRED));
        assert_eq!(report.operating_mode, Applied::Rewritten);
        assert_eq!(report.talking_mode, Applied::Rewritten);

        let (transport, _) = link.release();
        let writes = transport.sent().iter().filter(|s| s[0] == CMD_WRITE).count();
        assert_eq!(writes, 4);
    }

    #[test]
    fn failed_rewrite_is_reported() {
        let mut transport = MockTransport::new();
        transport.fail_sends = true;
        let mut link = Link::new(transport, MockDelay::default());

        let report = block_on(link.reconcile(ChipFamily::B, DESIRED));
        assert_eq!(report.operating_mode, Applied::Failed);
        assert_eq!(report.talking_mode, Applied::Failed);
    }
}
