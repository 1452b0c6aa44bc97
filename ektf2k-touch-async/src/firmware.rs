//! Firmware images and the per-variant image store.

use crate::identity::ChipFamily;

/// Bytes per flash page.
pub const PAGE_SIZE: usize = 132;
/// Pages per image.
pub const PAGE_COUNT: u16 = 249;
/// Bytes per image.
pub const IMAGE_SIZE: usize = PAGE_SIZE * PAGE_COUNT as usize;

/// A firmware image that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The image is shorter than [`IMAGE_SIZE`].
    TooShort {
        /// Actual length of the rejected image.
        len: usize,
    },
    /// A page number outside `1..=PAGE_COUNT` was requested.
    PageOutOfRange {
        page: u16,
    },
}

/// The panel glass vendor, strapped on the hardware-detect line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PanelKind {
    /// Detect line low.
    #[default]
    Truly,
    /// Detect line high.
    Eely,
}

impl PanelKind {
    /// Maps the level of the hardware-detect line to a panel.
    pub fn from_detect_level(high: bool) -> Self {
        if high {
            Self::Eely
        } else {
            Self::Truly
        }
    }
}

/// The (panel, chip family) pair firmware images are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    /// Panel glass vendor.
    pub panel: PanelKind,
    /// Controller family.
    pub family: ChipFamily,
}

impl Variant {
    fn slot(self) -> usize {
        let panel = match self.panel {
            PanelKind::Truly => 0,
            PanelKind::Eely => 2,
        };
        let family = match self.family {
            ChipFamily::A => 0,
            ChipFamily::B => 1,
        };
        panel + family
    }

    /// Offset of the little-endian target firmware id in the image trailer.
    fn id_offset(self) -> usize {
        match self.family {
            ChipFamily::A => 0x7D66,
            ChipFamily::B => 0x7E66,
        }
    }

    /// Offset of the little-endian target firmware version.
    fn version_offset(self) -> usize {
        match self.family {
            ChipFamily::A => 0x7D64,
            ChipFamily::B => 0x7E64,
        }
    }
}

/// A validated, borrowed firmware image.
#[derive(Clone, Copy)]
pub struct FirmwareImage<'a> {
    variant: Variant,
    bytes: &'a [u8],
}

impl<'a> FirmwareImage<'a> {
    /// Wraps `bytes` as the image for `variant`.
    ///
    /// Images shorter than [`IMAGE_SIZE`] are rejected. Trailing bytes beyond
    /// it are never transferred.
    pub fn new(variant: Variant, bytes: &'a [u8]) -> Result<Self, ImageError> {
        if bytes.len() < IMAGE_SIZE {
            return Err(ImageError::TooShort { len: bytes.len() });
        }
        Ok(Self {
            variant,
            bytes: &bytes[..IMAGE_SIZE],
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// The firmware id this image carries.
    pub fn embedded_id(&self) -> u16 {
        self.read_le(self.variant.id_offset())
    }

    /// The firmware version this image carries.
    pub fn embedded_version(&self) -> u16 {
        self.read_le(self.variant.version_offset())
    }

    /// Returns the 1-indexed `page`, or `None` outside `1..=PAGE_COUNT`.
    pub fn page(&self, page: u16) -> Option<&'a [u8]> {
        if page == 0 || page > PAGE_COUNT {
            return None;
        }
        let start = (page as usize - 1) * PAGE_SIZE;
        self.bytes.get(start..start + PAGE_SIZE)
    }

    fn read_le(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }
}

impl core::fmt::Debug for FirmwareImage<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FirmwareImage({:?}/{:?}, id 0x{:04x}, ver 0x{:04x})",
            self.variant.panel,
            self.variant.family,
            self.embedded_id(),
            self.embedded_version()
        )
    }
}

/// Up to one firmware image per variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirmwareStore<'a> {
    images: [Option<FirmwareImage<'a>>; 4],
}

impl<'a> FirmwareStore<'a> {
    /// A store without images. Bring-up never flashes with it.
    pub const fn empty() -> Self {
        Self { images: [None; 4] }
    }

    /// Validates `bytes` and registers it for `variant`, replacing any earlier
    /// image for the same variant.
    pub fn with_image(mut self, variant: Variant, bytes: &'a [u8]) -> Result<Self, ImageError> {
        let image = FirmwareImage::new(variant, bytes)?;
        self.images[variant.slot()] = Some(image);
        Ok(self)
    }

    /// Looks up the image for `variant`.
    pub fn select(&self, variant: Variant) -> Option<FirmwareImage<'a>> {
        self.images[variant.slot()]
    }
}

/// Decides whether bring-up reflashes the controller.
///
/// A blank part (`device_id == 0`) is always reflashed. Otherwise the image
/// must target the same firmware id and carry a strictly newer version.
pub fn should_update(device_id: u16, device_version: u16, image_id: u16, image_version: u16) -> bool {
    device_id == 0 || (image_id == device_id && image_version > device_version)
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec;

    use super::*;

    const B_TRULY: Variant = Variant {
        panel: PanelKind::Truly,
        family: ChipFamily::B,
    };

    #[test]
    fn trigger_table() {
        assert!(should_update(0x1234, 0x0100, 0x1234, 0x0101));
        assert!(!should_update(0x1234, 0x0100, 0x1234, 0x0100));
        assert!(!should_update(0x1234, 0x0100, 0x1234, 0x00FF));
        assert!(!should_update(0x1234, 0x0100, 0x4321, 0x0200));
        assert!(should_update(0x0000, 0x0100, 0x4321, 0x0001));
        assert!(should_update(0x0000, 0x0000, 0x0000, 0x0000));

        assert!(should_update(0x10, 0x0100, 0x10, 0x0200));
        assert!(!should_update(0x10, 0x0200, 0x10, 0x0100));
        // A blank device updates whatever the image carries.
        for (version, image_id, image_version) in [
            (0x0000, 0x10, 0x0000),
            (0xFFFF, 0x10, 0x0001),
            (0x0100, 0x0000, 0xFFFF),
        ] {
            assert!(should_update(0, version, image_id, image_version));
        }
    }

    #[test]
    fn short_images_are_rejected() {
        let bytes = vec![0u8; IMAGE_SIZE - 1];
        assert_eq!(
            FirmwareImage::new(B_TRULY, &bytes).err(),
            Some(ImageError::TooShort { len: IMAGE_SIZE - 1 })
        );

        let bytes = vec![0u8; IMAGE_SIZE + 16];
        let image = FirmwareImage::new(B_TRULY, &bytes).unwrap();
        assert_eq!(image.page(PAGE_COUNT).unwrap().len(), PAGE_SIZE);
    }

    #[test]
    fn trailer_offsets_depend_on_family() {
        let mut bytes = vec![0u8; IMAGE_SIZE];
        bytes[0x7E64] = 0x23;
        bytes[0x7E65] = 0x01;
        bytes[0x7E66] = 0xCD;
        bytes[0x7E67] = 0xAB;
        bytes[0x7D64] = 0x11;
        bytes[0x7D65] = 0x55;
        bytes[0x7D66] = 0x02;
        bytes[0x7D67] = 0x00;

        let b = FirmwareImage::new(B_TRULY, &bytes).unwrap();
        assert_eq!(b.embedded_id(), 0xABCD);
        assert_eq!(b.embedded_version(), 0x0123);

        let a_variant = Variant {
            panel: PanelKind::Eely,
            family: ChipFamily::A,
        };
        let a = FirmwareImage::new(a_variant, &bytes).unwrap();
        assert_eq!(a.embedded_id(), 0x0002);
        assert_eq!(a.embedded_version(), 0x5511);
    }

    #[test]
    fn pages_are_one_indexed() {
        let bytes: std::vec::Vec<u8> = (0..IMAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8).collect();
        let image = FirmwareImage::new(B_TRULY, &bytes).unwrap();
        assert!(image.page(0).is_none());
        assert!(image.page(PAGE_COUNT + 1).is_none());
        assert!(image.page(1).unwrap().iter().all(|b| *b == 0));
        assert!(image.page(PAGE_COUNT).unwrap().iter().all(|b| *b == 248));
    }

    #[test]
    fn store_selects_by_variant() {
        let truly_b = vec![1u8; IMAGE_SIZE];
        let eely_b = vec![2u8; IMAGE_SIZE];
        let eely_b_variant = Variant {
            panel: PanelKind::Eely,
            family: ChipFamily::B,
        };
        let store = FirmwareStore::empty()
            .with_image(B_TRULY, &truly_b)
            .unwrap()
            .with_image(eely_b_variant, &eely_b)
            .unwrap();

        assert_eq!(store.select(B_TRULY).unwrap().page(1).unwrap()[0], 1);
        assert_eq!(store.select(eely_b_variant).unwrap().page(1).unwrap()[0], 2);
        assert!(store
            .select(Variant {
                panel: PanelKind::Truly,
                family: ChipFamily::A,
            })
            .is_none());
        assert_eq!(PanelKind::from_detect_level(true), PanelKind::Eely);
    }
}
