use thiserror::Error;

#[derive(Debug,Error,Clone,PartialEq,Eq)]
pub enum ProtocolError
{
    #[error("frame too short for a command: {0} bytes")]
    TooShort(usize),
    #[error("frame should not contain null characters")]
    NullByte,
    #[error("invalid frame delimiter")]
    MissingDelimiter,
    #[error("unknown command kind: {0}")]
    UnknownKind(char),
    #[error("short {0} command")]
    ShortCommand(&'static str),
    #[error("separator expected: '{0}'")]
    SeparatorExpected(String),
    #[error("short feature: '{0}'")]
    ShortFeature(String),
    #[error("invalid session id: '{0}'")]
    InvalidSid(String),
    #[error("invalid client id: {0}")]
    InvalidCid(String),
    #[error("invalid feature tag: '{0}'")]
    InvalidFeature(String),
}
