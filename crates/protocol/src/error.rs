use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer too small: {0} bytes needed, {1} bytes available")]
    BufferTooSmall(usize, usize),

    #[error("unknown protocol flag: {0:#06x}")]
    UnknownFlag(u16),

    #[error("truncated frame for flag {flag:#06x}: {length} bytes")]
    TruncatedFrame { flag: u16, length: usize },

    #[error("connection id must be exactly {0} bytes, got {1}")]
    BadConnectionIdLength(usize, usize),

    #[error("unsupported control version: {0}")]
    UnsupportedControlVersion(u8),

    #[error("datagram limit {max} cannot carry the {header}-byte header plus payload")]
    DatagramTooSmall { max: u32, header: u32 },

    #[error("frame of {frame} bytes cannot be split into {chunks} datagrams of at most {max} bytes")]
    UnsplittableFrame { frame: u32, max: u32, chunks: u32 },
}
