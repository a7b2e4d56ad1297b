#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("segment shorter than a TCP header")]
    Truncated,

    #[error("header length {0} words is smaller than the fixed 5-word header")]
    BadHeaderLen(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
