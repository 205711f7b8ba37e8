use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("uid {uid} is already in flight")]
    DuplicateUid { uid: u32 },

    #[error("no decision process peer is known")]
    NoPeer,

    #[error("bridge is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
