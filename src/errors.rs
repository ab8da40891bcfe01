use bitcoin::OutPoint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("Corrupted record: {0}")]
    DecodeFailure(String),
    #[error("Channel not found: {0:?}")]
    ChannelNotFound(OutPoint),
    #[error("No retribution state has been recorded")]
    NoRetributions,
    #[error("Chain notifier shut down")]
    NotifierShutdown,
    #[error("Output too small to sweep in isolation: {0} sats")]
    OutputTooSmall(i64),
    #[error("Signer error: {0}")]
    Signer(String),
    #[error("Secp256k1 error: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),
    #[error("Sighash error: {0}")]
    Sighash(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
