use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level network result: `Wait` means "nothing to do right now, retry
/// later" (e.g. a would-block receive); `Fatal` carries a terminal fault.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(FaultKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// Mini-packet header claims more bytes than the datagram holds.
    Malformed,
    /// Unrecognized 4-bit packet type tag.
    UnknownPacketType,
    PayloadTooLarge,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(FaultKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
