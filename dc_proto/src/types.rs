use std::fmt;
use std::str::FromStr;

use crate::errors::ProtocolError;

/// Length of a session identifier on the wire.
pub const SID_LEN: usize = 4;

/// Length of a client identifier on the wire.
pub const CID_LEN: usize = 39;

/// The base32 alphabet used by ADC for SIDs and CIDs.
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn decode32(c: u8) -> Option<u32>
{
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u32),
        b'2'..=b'7' => Some((c - b'2' + 26) as u32),
        _ => None,
    }
}

/// A session identifier: a 20-bit value rendered as four base32 characters.
///
/// `AAAA` (zero) is the hub's own SID and is never assigned to a peer.
#[derive(Clone,Copy,Default,PartialEq,Eq,Hash,PartialOrd,Ord)]
pub struct Sid(u32);

impl Sid
{
    /// The hub's own session identifier.
    pub const HUB: Sid = Sid(0);

    /// The largest value a four-character SID can carry.
    pub const MAX_VALUE: u32 = (1 << 20) - 1;

    pub fn new(value: u32) -> Self
    {
        debug_assert!(value <= Self::MAX_VALUE);
        Self(value & Self::MAX_VALUE)
    }

    pub fn value(self) -> u32
    {
        self.0
    }

    /// Parses exactly [`SID_LEN`] bytes of base32.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError>
    {
        if bytes.len() != SID_LEN {
            return Err(ProtocolError::InvalidSid(String::from_utf8_lossy(bytes).into_owned()));
        }
        let mut value = 0u32;
        for &c in bytes {
            let v = decode32(c)
                .ok_or_else(|| ProtocolError::InvalidSid(String::from_utf8_lossy(bytes).into_owned()))?;
            value = (value << 5) | v;
        }
        Ok(Self(value))
    }

    pub fn encode(self) -> [u8; SID_LEN]
    {
        let mut out = [0u8; SID_LEN];
        for (i, b) in out.iter_mut().enumerate() {
            let shift = 5 * (SID_LEN - 1 - i);
            *b = ALPHABET[((self.0 >> shift) & 31) as usize];
        }
        out
    }
}

impl fmt::Display for Sid
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        let enc = self.encode();
        // the alphabet is ASCII
        f.write_str(std::str::from_utf8(&enc).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for Sid
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Sid({})", self)
    }
}

impl FromStr for Sid
{
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        Self::parse(s.as_bytes())
    }
}

/// A client identifier: 24 bytes rendered as 39 base32 characters.
///
/// Stable across sessions and chosen by the client; the hub relays it but
/// does not enforce uniqueness.
#[derive(Clone,Copy,PartialEq,Eq,Hash)]
pub struct Cid([u8; 24]);

impl Cid
{
    pub fn from_bytes(bytes: [u8; 24]) -> Self
    {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 24]
    {
        &self.0
    }

    pub fn from_base32(s: &str) -> Result<Self, ProtocolError>
    {
        let bytes = s.as_bytes();
        if bytes.len() != CID_LEN {
            return Err(ProtocolError::InvalidCid(format!("wrong length: {}", bytes.len())));
        }
        let mut out = [0u8; 24];
        let mut acc = 0u32;
        let mut bits = 0usize;
        let mut idx = 0usize;
        for &c in bytes {
            let v = decode32(c)
                .ok_or_else(|| ProtocolError::InvalidCid(format!("bad character: {}", c as char)))?;
            acc = (acc << 5) | v;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                if idx < out.len() {
                    out[idx] = (acc >> bits) as u8;
                    idx += 1;
                }
            }
        }
        Ok(Self(out))
    }

    pub fn to_base32(&self) -> String
    {
        let mut s = String::with_capacity(CID_LEN);
        let mut acc = 0u32;
        let mut bits = 0usize;
        for &b in &self.0 {
            acc = (acc << 8) | b as u32;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                s.push(ALPHABET[((acc >> bits) & 31) as usize] as char);
            }
        }
        if bits > 0 {
            s.push(ALPHABET[((acc << (5 - bits)) & 31) as usize] as char);
        }
        s
    }
}

impl fmt::Display for Cid
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cid
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid
{
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        Self::from_base32(s)
    }
}

/// A four-letter tag identifying an optional protocol feature.
#[derive(Clone,Copy,PartialEq,Eq,Hash,PartialOrd,Ord)]
pub struct Feature([u8; 4]);

impl Feature
{
    pub const BASE: Feature = Feature(*b"BASE");
    pub const TIGR: Feature = Feature(*b"TIGR");
    pub const TCP4: Feature = Feature(*b"TCP4");
    pub const NAT0: Feature = Feature(*b"NAT0");

    pub fn from_bytes(bytes: [u8; 4]) -> Self
    {
        Self(bytes)
    }

    pub fn as_str(&self) -> &str
    {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for Feature
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Feature
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Feature({})", self)
    }
}

impl FromStr for Feature
{
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(ProtocolError::InvalidFeature(s.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// A three-letter command name.
#[derive(Clone,Copy,PartialEq,Eq,Hash)]
pub struct CmdName(pub [u8; 3]);

impl CmdName
{
    pub const SUP: CmdName = CmdName(*b"SUP");
    pub const SID: CmdName = CmdName(*b"SID");
    pub const INF: CmdName = CmdName(*b"INF");
    pub const MSG: CmdName = CmdName(*b"MSG");
    pub const SCH: CmdName = CmdName(*b"SCH");
    pub const RES: CmdName = CmdName(*b"RES");
    pub const CTM: CmdName = CmdName(*b"CTM");
    pub const RCM: CmdName = CmdName(*b"RCM");
    pub const QUI: CmdName = CmdName(*b"QUI");
    pub const STA: CmdName = CmdName(*b"STA");
    pub const GPA: CmdName = CmdName(*b"GPA");
    pub const PAS: CmdName = CmdName(*b"PAS");

    pub fn as_str(&self) -> &str
    {
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for CmdName
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CmdName
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "CmdName({})", self)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn sid_encodes_base32()
    {
        assert_eq!(Sid::HUB.to_string(), "AAAA");
        assert_eq!(Sid::new(1).to_string(), "AAAB");
        assert_eq!(Sid::new(26).to_string(), "AAA2");
        assert_eq!(Sid::new(32).to_string(), "AABA");
    }

    #[test]
    fn sid_roundtrip()
    {
        for v in [0u32, 1, 31, 32, 12345, Sid::MAX_VALUE] {
            let sid = Sid::new(v);
            let parsed = Sid::parse(&sid.encode()).unwrap();
            assert_eq!(parsed, sid);
        }
    }

    #[test]
    fn sid_rejects_bad_input()
    {
        assert!(Sid::parse(b"AAA").is_err());
        assert!(Sid::parse(b"AA@A").is_err());
        assert!(Sid::parse(b"aaaa").is_err());
        assert!("AB\nD".parse::<Sid>().is_err());
    }

    #[test]
    fn cid_roundtrip()
    {
        let zero = Cid::from_bytes([0u8; 24]);
        assert_eq!(zero.to_base32(), "A".repeat(39));
        assert_eq!(Cid::from_base32(&zero.to_base32()).unwrap(), zero);

        let mut bytes = [0u8; 24];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i * 11) as u8;
        }
        let cid = Cid::from_bytes(bytes);
        let enc = cid.to_base32();
        assert_eq!(enc.len(), CID_LEN);
        assert_eq!(Cid::from_base32(&enc).unwrap(), cid);
    }

    #[test]
    fn cid_rejects_bad_input()
    {
        assert!(Cid::from_base32("SHORT").is_err());
        assert!(Cid::from_base32(&"a".repeat(39)).is_err());
        assert!(Cid::from_base32(&"1".repeat(39)).is_err());
    }
}
