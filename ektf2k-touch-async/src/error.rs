//! Error types for the EKTF2K driver.

use core::fmt::{self, Debug};

use crate::firmware::ImageError;

/// A failure of the byte transport itself.
pub enum TransportError<E> {
    /// The underlying bus or pin reported an error.
    Bus(E),
    /// Fewer bytes were written than requested.
    ShortWrite {
        /// Bytes the driver asked to send.
        expected: usize,
        /// Bytes the transport accepted.
        written: usize,
    },
    /// Fewer bytes were read than requested.
    ShortRead {
        /// Bytes the driver asked for.
        expected: usize,
        /// Bytes the transport delivered.
        read: usize,
    },
    /// The controller never asserted its ready line.
    ReadyTimeout,
}

impl<E: Debug> Debug for TransportError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(err) => write!(f, "Bus({err:?})"),
            Self::ShortWrite { expected, written } => {
                write!(f, "ShortWrite({written}/{expected})")
            }
            Self::ShortRead { expected, read } => write!(f, "ShortRead({read}/{expected})"),
            Self::ReadyTimeout => write!(f, "ReadyTimeout"),
        }
    }
}

/// The controller answered, but not in a way the protocol allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A page acknowledgement that is neither "accepted" nor "rewrite".
    UnexpectedAck([u8; 2]),
    /// A frame whose first byte names no known layout.
    UnknownMarker(u8),
    /// A command response that does not start with the response header.
    UnexpectedHeader(u8),
    /// The controller did not confirm entering ISP mode.
    IspRefused(u8),
}

/// Terminal outcomes of a firmware update that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFailure {
    /// ISP mode could not be entered within the restart budget.
    EntryExhausted,
    /// A single page was rejected with "rewrite" too many times.
    RewriteExhausted,
    /// The transfer had to be restarted from entry too many times.
    RestartExhausted,
    /// The caller asked to stop before entry or between two pages.
    Cancelled,
}

/// The main error type for the EKTF2K driver.
pub enum Error<E> {
    /// A transport-level failure.
    Transport(TransportError<E>),
    /// A protocol-level failure.
    Protocol(ProtocolError),
    /// The controller never answered the hello probe.
    ChipAbsent,
    /// A firmware update ended without success.
    Update(UpdateFailure),
    /// A firmware image failed validation.
    Image(ImageError),
    /// No firmware image is registered for the detected variant.
    NoImage,
    /// The operation is not allowed while the update lock is held.
    Locked,
}

impl<E: Debug> Debug for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "Transport({err:?})"),
            Self::Protocol(err) => write!(f, "Protocol({err:?})"),
            Self::ChipAbsent => write!(f, "ChipAbsent"),
            Self::Update(err) => write!(f, "Update({err:?})"),
            Self::Image(err) => write!(f, "Image({err:?})"),
            Self::NoImage => write!(f, "NoImage"),
            Self::Locked => write!(f, "Locked"),
        }
    }
}

impl<E> From<TransportError<E>> for Error<E> {
    fn from(err: TransportError<E>) -> Self {
        Error::Transport(err)
    }
}

impl<E> From<ProtocolError> for Error<E> {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl<E> From<UpdateFailure> for Error<E> {
    fn from(err: UpdateFailure) -> Self {
        Error::Update(err)
    }
}

impl<E> From<ImageError> for Error<E> {
    fn from(err: ImageError) -> Self {
        Error::Image(err)
    }
}

/// Stable error codes handed to the host control surface.
///
/// The values follow the negative errno convention of the ioctl interface the
/// control surface replaces.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bus failure or short transfer.
    Io = -5,
    /// Operation refused while locked.
    Busy = -16,
    /// No controller answered.
    NoDevice = -19,
    /// Invalid firmware image.
    Invalid = -22,
    /// No firmware image for the variant.
    NoData = -61,
    /// Protocol violation.
    Protocol = -71,
    /// Update cancelled.
    Cancelled = -125,
    /// Ready line never asserted, or an update budget ran out.
    Timeout = -110,
}

impl<E> Error<E> {
    /// Maps the error onto the code reported through the control surface.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(TransportError::ReadyTimeout) => ErrorCode::Timeout,
            Self::Transport(_) => ErrorCode::Io,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::ChipAbsent => ErrorCode::NoDevice,
            Self::Update(UpdateFailure::Cancelled) => ErrorCode::Cancelled,
            Self::Update(_) => ErrorCode::Timeout,
            Self::Image(_) => ErrorCode::Invalid,
            Self::NoImage => ErrorCode::NoData,
            Self::Locked => ErrorCode::Busy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_errno_convention() {
        let timeout: Error<()> = TransportError::ReadyTimeout.into();
        assert_eq!(timeout.code() as i32, -110);

        let short: Error<()> = TransportError::ShortRead { expected: 4, read: 1 }.into();
        assert_eq!(short.code(), ErrorCode::Io);

        let cancelled: Error<()> = UpdateFailure::Cancelled.into();
        assert_eq!(cancelled.code(), ErrorCode::Cancelled);

        assert_eq!(Error::<()>::ChipAbsent.code() as i32, -19);
        assert_eq!(Error::<()>::Locked.code(), ErrorCode::Busy);
    }

    #[test]
    fn debug_names_the_variant() {
        extern crate std;
        use std::format;

        let err: Error<u8> = TransportError::ShortWrite { expected: 8, written: 3 }.into();
        assert_eq!(format!("{err:?}"), "Transport(ShortWrite(3/8))");

        let err: Error<u8> = ProtocolError::UnknownMarker(0x42).into();
        assert_eq!(format!("{err:?}"), "Protocol(UnknownMarker(66))");
    }
}
