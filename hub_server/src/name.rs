use std::fmt;

use thiserror::Error;

#[derive(Debug,Error,Clone,PartialEq,Eq)]
pub enum InvalidNickname
{
    #[error("name should not be empty")]
    Empty,
    #[error("name should not start with '{0}'")]
    ReservedPrefix(char),
    #[error("name should not start or end with spaces")]
    OuterWhitespace,
    #[error("name should not contain control characters")]
    ControlCharacter,
}

/// A validated user-visible nickname, globally unique across all protocols
/// while its owner is connected.
#[derive(Clone,Debug,PartialEq,Eq,Hash,PartialOrd,Ord)]
pub struct Nickname(String);

impl Nickname
{
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidNickname>
    {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    /// Enforces the nickname rules without allocating.
    pub fn validate(value: &str) -> Result<(), InvalidNickname>
    {
        if value.is_empty() {
            return Err(InvalidNickname::Empty);
        }
        if value.starts_with('#') {
            return Err(InvalidNickname::ReservedPrefix('#'));
        }
        if value.starts_with('!') {
            return Err(InvalidNickname::ReservedPrefix('!'));
        }
        if value != value.trim() {
            return Err(InvalidNickname::OuterWhitespace);
        }
        if value.chars().any(char::is_control) {
            return Err(InvalidNickname::ControlCharacter);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str
    {
        &self.0
    }
}

impl fmt::Display for Nickname
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Nickname
{
    fn as_ref(&self) -> &str
    {
        &self.0
    }
}

impl std::str::FromStr for Nickname
{
    type Err = InvalidNickname;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        Self::new(s)
    }
}
