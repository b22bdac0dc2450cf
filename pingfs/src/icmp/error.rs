use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame shorter than the echo header")]
    TooShort,

    #[error("unknown icmp type {0}")]
    UnknownType(u8),

    #[error("bad icmp code {0}")]
    BadCode(u8),

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("payload does not fit the buffer")]
    Oversize,
}

pub type PacketResult<T> = Result<T, PacketError>;
