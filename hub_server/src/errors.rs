use thiserror::Error;

use crate::name::InvalidNickname;

/// Failure to hand a frame to a peer's send queue.
#[derive(Debug,Error,Clone,PartialEq,Eq)]
pub enum PeerError
{
    #[error("peer connection is closed")]
    Closed,
    #[error("peer send queue is full")]
    SendQueueFull,
}

/// Failures of the name/session bookkeeping.
#[derive(Debug,Error,Clone,PartialEq,Eq)]
pub enum RegistryError
{
    #[error("nickname is already in use")]
    NickTaken,
    #[error(transparent)]
    BadNick(#[from] InvalidNickname),
    #[error("session identifiers exhausted")]
    SidExhausted,
    #[error("user registration is disabled")]
    RegistrationDisabled,
    #[error(transparent)]
    UserDb(#[from] UserDbError),
}

/// A user database backend failure.
#[derive(Debug,Error,Clone,PartialEq,Eq)]
#[error("user database error: {0}")]
pub struct UserDbError(pub String);

#[derive(Debug,Error)]
pub enum HandshakeError
{
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed during handshake")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] dc_proto::ProtocolError),
    #[error("expected {expected}, got: {got}")]
    Unexpected
    {
        expected: &'static str,
        got: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Top-level failure of a served connection.
#[derive(Debug,Error)]
pub enum HubError
{
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] dc_proto::ProtocolError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}
