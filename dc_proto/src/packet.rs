//! The ADC packet codec.
//!
//! [`Packet::decode`] consumes one whole frame including the trailing
//! newline; [`Packet::encode`] produces the exact bytes a conforming decoder
//! recovers losslessly. Feature filters are kept in a [`BTreeMap`] so that
//! encoding order is deterministic.

use std::collections::BTreeMap;

use crate::errors::ProtocolError;
use crate::types::{Cid, CmdName, Feature, Sid, CID_LEN};

/// Every frame ends with exactly one of these.
pub const LINE_DELIM: u8 = b'\n';

const KIND_BROADCAST: u8 = b'B';
const KIND_CLIENT: u8 = b'C';
const KIND_DIRECT: u8 = b'D';
const KIND_ECHO: u8 = b'E';
const KIND_FEATURE: u8 = b'F';
const KIND_HUB: u8 = b'H';
const KIND_INFO: u8 = b'I';
const KIND_UDP: u8 = b'U';

/// A hub-originated information message. No addressing.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct InfoPacket
{
    pub name: CmdName,
    pub data: Vec<u8>,
}

/// A client-to-hub request. No addressing.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct HubPacket
{
    pub name: CmdName,
    pub data: Vec<u8>,
}

/// A client broadcast relayed by the hub. Carries the source SID.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct BroadcastPacket
{
    pub name: CmdName,
    pub id: Sid,
    pub data: Vec<u8>,
}

/// A client-to-client message routed by the hub. Source and target SIDs.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct DirectPacket
{
    pub name: CmdName,
    pub id: Sid,
    pub targ: Sid,
    pub data: Vec<u8>,
}

/// Same shape as [`DirectPacket`], but the hub also echoes the frame back
/// to its source.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct EchoPacket
{
    pub name: CmdName,
    pub id: Sid,
    pub targ: Sid,
    pub data: Vec<u8>,
}

/// A broadcast filtered by peer features: only peers that have every `+`
/// feature and lack every `-` feature receive it.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct FeaturePacket
{
    pub name: CmdName,
    pub id: Sid,
    pub features: BTreeMap<Feature, bool>,
    pub data: Vec<u8>,
}

/// A message on a direct client-to-client connection. Never seen by the hub
/// on its own port, but the codec is shared with client implementations.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct ClientPacket
{
    pub name: CmdName,
    pub data: Vec<u8>,
}

/// A UDP-carried message, addressed by the stable client identifier.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct UdpPacket
{
    pub name: CmdName,
    pub id: Cid,
    pub data: Vec<u8>,
}

/// One decoded ADC frame of any kind.
#[derive(Debug,Clone,PartialEq,Eq)]
pub enum Packet
{
    Info(InfoPacket),
    Hub(HubPacket),
    Broadcast(BroadcastPacket),
    Direct(DirectPacket),
    Echo(EchoPacket),
    Feature(FeaturePacket),
    Client(ClientPacket),
    Udp(UdpPacket),
}

impl Packet
{
    /// Decodes one frame, which must include the trailing newline.
    pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError>
    {
        if frame.len() < 5 {
            return Err(ProtocolError::TooShort(frame.len()));
        }
        if frame.contains(&0) {
            return Err(ProtocolError::NullByte);
        }
        let kind = frame[0];
        let name = CmdName([frame[1], frame[2], frame[3]]);
        let rest = &frame[4..];
        // after the command name either a space introduces the body, or the
        // frame ends immediately
        let body: &[u8] = match rest.first() {
            Some(&b' ') => &rest[1..],
            Some(&LINE_DELIM) => &[],
            Some(_) => return Err(ProtocolError::SeparatorExpected(lossy(&frame[..5]))),
            None => &[],
        };
        match kind {
            KIND_INFO => Ok(Packet::Info(InfoPacket { name, data: decode_plain(body)? })),
            KIND_HUB => Ok(Packet::Hub(HubPacket { name, data: decode_plain(body)? })),
            KIND_CLIENT => Ok(Packet::Client(ClientPacket { name, data: decode_plain(body)? })),
            KIND_BROADCAST => {
                let (id, data) = decode_sourced(body, "broadcast")?;
                Ok(Packet::Broadcast(BroadcastPacket { name, id, data }))
            }
            KIND_DIRECT => {
                let (id, targ, data) = decode_targeted(body, "direct")?;
                Ok(Packet::Direct(DirectPacket { name, id, targ, data }))
            }
            KIND_ECHO => {
                let (id, targ, data) = decode_targeted(body, "echo")?;
                Ok(Packet::Echo(EchoPacket { name, id, targ, data }))
            }
            KIND_FEATURE => {
                let (id, features, data) = decode_feature(body)?;
                Ok(Packet::Feature(FeaturePacket { name, id, features, data }))
            }
            KIND_UDP => {
                let (id, data) = decode_udp(body)?;
                Ok(Packet::Udp(UdpPacket { name, id, data }))
            }
            other => Err(ProtocolError::UnknownKind(other as char)),
        }
    }

    /// Produces the frame bytes, trailing newline included.
    pub fn encode(&self) -> Vec<u8>
    {
        let mut buf = Vec::with_capacity(32);
        match self {
            Packet::Info(p) => encode_plain(&mut buf, KIND_INFO, p.name, &p.data),
            Packet::Hub(p) => encode_plain(&mut buf, KIND_HUB, p.name, &p.data),
            Packet::Client(p) => encode_plain(&mut buf, KIND_CLIENT, p.name, &p.data),
            Packet::Broadcast(p) => {
                header(&mut buf, KIND_BROADCAST, p.name);
                buf.push(b' ');
                buf.extend_from_slice(&p.id.encode());
                payload(&mut buf, &p.data);
            }
            Packet::Direct(p) => encode_targeted(&mut buf, KIND_DIRECT, p.name, p.id, p.targ, &p.data),
            Packet::Echo(p) => encode_targeted(&mut buf, KIND_ECHO, p.name, p.id, p.targ, &p.data),
            Packet::Feature(p) => {
                header(&mut buf, KIND_FEATURE, p.name);
                buf.push(b' ');
                buf.extend_from_slice(&p.id.encode());
                for (feature, required) in &p.features {
                    buf.push(b' ');
                    buf.push(if *required { b'+' } else { b'-' });
                    buf.extend_from_slice(feature.as_str().as_bytes());
                }
                payload(&mut buf, &p.data);
            }
            Packet::Udp(p) => {
                header(&mut buf, KIND_UDP, p.name);
                buf.push(b' ');
                buf.extend_from_slice(p.id.to_base32().as_bytes());
                payload(&mut buf, &p.data);
            }
        }
        buf
    }

    pub fn kind(&self) -> u8
    {
        match self {
            Packet::Info(_) => KIND_INFO,
            Packet::Hub(_) => KIND_HUB,
            Packet::Broadcast(_) => KIND_BROADCAST,
            Packet::Direct(_) => KIND_DIRECT,
            Packet::Echo(_) => KIND_ECHO,
            Packet::Feature(_) => KIND_FEATURE,
            Packet::Client(_) => KIND_CLIENT,
            Packet::Udp(_) => KIND_UDP,
        }
    }

    pub fn name(&self) -> CmdName
    {
        match self {
            Packet::Info(p) => p.name,
            Packet::Hub(p) => p.name,
            Packet::Broadcast(p) => p.name,
            Packet::Direct(p) => p.name,
            Packet::Echo(p) => p.name,
            Packet::Feature(p) => p.name,
            Packet::Client(p) => p.name,
            Packet::Udp(p) => p.name,
        }
    }

    /// The source SID, for the kinds that carry one.
    pub fn source(&self) -> Option<Sid>
    {
        match self {
            Packet::Broadcast(p) => Some(p.id),
            Packet::Direct(p) => Some(p.id),
            Packet::Echo(p) => Some(p.id),
            Packet::Feature(p) => Some(p.id),
            _ => None,
        }
    }

    /// The target SID, for the kinds that carry one.
    pub fn target(&self) -> Option<Sid>
    {
        match self {
            Packet::Direct(p) => Some(p.targ),
            Packet::Echo(p) => Some(p.targ),
            _ => None,
        }
    }

    pub fn data(&self) -> &[u8]
    {
        match self {
            Packet::Info(p) => &p.data,
            Packet::Hub(p) => &p.data,
            Packet::Broadcast(p) => &p.data,
            Packet::Direct(p) => &p.data,
            Packet::Echo(p) => &p.data,
            Packet::Feature(p) => &p.data,
            Packet::Client(p) => &p.data,
            Packet::Udp(p) => &p.data,
        }
    }
}

fn lossy(bytes: &[u8]) -> String
{
    String::from_utf8_lossy(bytes).into_owned()
}

fn header(buf: &mut Vec<u8>, kind: u8, name: CmdName)
{
    buf.push(kind);
    buf.extend_from_slice(&name.0);
}

fn payload(buf: &mut Vec<u8>, data: &[u8])
{
    if !data.is_empty() {
        buf.push(b' ');
        buf.extend_from_slice(data);
    }
    buf.push(LINE_DELIM);
}

fn encode_plain(buf: &mut Vec<u8>, kind: u8, name: CmdName, data: &[u8])
{
    header(buf, kind, name);
    payload(buf, data);
}

fn encode_targeted(buf: &mut Vec<u8>, kind: u8, name: CmdName, id: Sid, targ: Sid, data: &[u8])
{
    header(buf, kind, name);
    buf.push(b' ');
    buf.extend_from_slice(&id.encode());
    buf.push(b' ');
    buf.extend_from_slice(&targ.encode());
    payload(buf, data);
}

/// Strips the delimiter from a body with no addressing. An absent body is
/// the empty payload.
fn decode_plain(body: &[u8]) -> Result<Vec<u8>, ProtocolError>
{
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if body[body.len() - 1] != LINE_DELIM {
        return Err(ProtocolError::MissingDelimiter);
    }
    Ok(body[..body.len() - 1].to_vec())
}

fn decode_sourced(body: &[u8], what: &'static str) -> Result<(Sid, Vec<u8>), ProtocolError>
{
    if body.len() < 4 {
        return Err(ProtocolError::ShortCommand(what));
    }
    if body[body.len() - 1] != LINE_DELIM {
        return Err(ProtocolError::MissingDelimiter);
    }
    if body.len() > 4 && body[4] != b' ' && body[4] != LINE_DELIM {
        return Err(ProtocolError::SeparatorExpected(lossy(&body[..5])));
    }
    let body = &body[..body.len() - 1];
    if body.len() < 4 {
        return Err(ProtocolError::InvalidSid(lossy(body)));
    }
    let id = Sid::parse(&body[0..4])?;
    let data = if body.len() > 5 { body[5..].to_vec() } else { Vec::new() };
    Ok((id, data))
}

fn decode_targeted(body: &[u8], what: &'static str) -> Result<(Sid, Sid, Vec<u8>), ProtocolError>
{
    if body.len() < 9 {
        return Err(ProtocolError::ShortCommand(what));
    }
    if body[body.len() - 1] != LINE_DELIM {
        return Err(ProtocolError::MissingDelimiter);
    }
    if body[4] != b' ' {
        return Err(ProtocolError::SeparatorExpected(lossy(&body[..9])));
    }
    if body.len() > 9 && body[9] != b' ' && body[9] != LINE_DELIM {
        return Err(ProtocolError::SeparatorExpected(lossy(&body[..10])));
    }
    let body = &body[..body.len() - 1];
    if body.len() < 9 {
        return Err(ProtocolError::InvalidSid(lossy(body)));
    }
    let id = Sid::parse(&body[0..4])?;
    let targ = Sid::parse(&body[5..9])?;
    let data = if body.len() > 10 { body[10..].to_vec() } else { Vec::new() };
    Ok((id, targ, data))
}

fn decode_feature(body: &[u8]) -> Result<(Sid, BTreeMap<Feature, bool>, Vec<u8>), ProtocolError>
{
    let (id, region) = decode_sourced(body, "feature")?;

    let mut features = BTreeMap::new();
    let mut rest = region.as_slice();
    loop {
        match rest.first().copied() {
            Some(sigil @ (b'+' | b'-')) => {
                if rest.len() < 5 {
                    return Err(ProtocolError::ShortFeature(lossy(rest)));
                }
                let tag = Feature::from_bytes([rest[1], rest[2], rest[3], rest[4]]);
                features.insert(tag, sigil == b'+');
                rest = &rest[5..];
                match rest.first() {
                    Some(&b' ') => rest = &rest[1..],
                    Some(_) | None => break,
                }
            }
            _ => break,
        }
    }
    Ok((id, features, rest.to_vec()))
}

fn decode_udp(body: &[u8]) -> Result<(Cid, Vec<u8>), ProtocolError>
{
    if body.len() < CID_LEN {
        return Err(ProtocolError::ShortCommand("udp"));
    }
    if body[body.len() - 1] != LINE_DELIM {
        return Err(ProtocolError::MissingDelimiter);
    }
    if body.len() > CID_LEN && body[CID_LEN] != b' ' && body[CID_LEN] != LINE_DELIM {
        return Err(ProtocolError::SeparatorExpected(lossy(&body[..CID_LEN + 1])));
    }
    let body = &body[..body.len() - 1];
    if body.len() < CID_LEN {
        return Err(ProtocolError::InvalidCid(format!("wrong length: {}", body.len())));
    }
    let id = Cid::from_base32(
        std::str::from_utf8(&body[..CID_LEN])
            .map_err(|_| ProtocolError::InvalidCid("not ascii".to_string()))?,
    )?;
    let data = if body.len() > CID_LEN + 1 { body[CID_LEN + 1..].to_vec() } else { Vec::new() };
    Ok((id, data))
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sid(s: &str) -> Sid
    {
        s.parse().unwrap()
    }

    fn roundtrip(frame: &[u8]) -> Packet
    {
        let packet = Packet::decode(frame).unwrap();
        assert_eq!(packet.encode(), frame, "re-encoding {:?}", lossy(frame));
        packet
    }

    #[test]
    fn decodes_broadcast_message()
    {
        let packet = roundtrip(b"BMSG ABCD hello\n");
        let Packet::Broadcast(p) = packet else { panic!("wrong kind") };
        assert_eq!(p.name, CmdName::MSG);
        assert_eq!(p.id, sid("ABCD"));
        assert_eq!(p.data, b"hello");
    }

    #[test]
    fn decodes_feature_filter()
    {
        let packet = Packet::decode(b"FSCH ABCD +TCP4 -NAT0 TR:xyz\n").unwrap();
        let Packet::Feature(p) = packet else { panic!("wrong kind") };
        assert_eq!(p.name, CmdName::SCH);
        assert_eq!(p.id, sid("ABCD"));
        assert_eq!(p.features.get(&Feature::TCP4), Some(&true));
        assert_eq!(p.features.get(&Feature::NAT0), Some(&false));
        assert_eq!(p.features.len(), 2);
        assert_eq!(p.data, b"TR:xyz");
    }

    #[test]
    fn feature_filter_without_payload()
    {
        let packet = Packet::decode(b"FSCH ABCD +TCP4\n").unwrap();
        let Packet::Feature(p) = packet else { panic!("wrong kind") };
        assert_eq!(p.features.len(), 1);
        assert!(p.data.is_empty());
    }

    #[test]
    fn feature_set_decode_encode_is_lossless()
    {
        let packet = Packet::decode(b"FSCH ABCD +TCP4 -NAT0 TR:xyz\n").unwrap();
        let again = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(again, packet);
    }

    #[test]
    fn empty_payloads_are_legal()
    {
        for frame in [
            b"IINF\n".as_slice(),
            b"HSUP\n",
            b"CGET\n",
            b"BINF ABCD\n",
            b"DCTM ABCD EFGH\n",
            b"EMSG ABCD EFGH\n",
            b"FSCH ABCD\n",
        ] {
            let packet = roundtrip(frame);
            assert!(packet.data().is_empty(), "payload of {:?}", lossy(frame));
        }
    }

    #[test]
    fn udp_roundtrip()
    {
        let cid = "A".repeat(39);
        let frame = format!("USCH {} TR:xyz\n", cid).into_bytes();
        let packet = roundtrip(&frame);
        let Packet::Udp(p) = packet else { panic!("wrong kind") };
        assert_eq!(p.id, Cid::from_bytes([0u8; 24]));
        assert_eq!(p.data, b"TR:xyz");

        let bare = format!("UINF {}\n", cid).into_bytes();
        assert!(roundtrip(&bare).data().is_empty());
    }

    #[test]
    fn rejects_null_bytes()
    {
        assert_eq!(Packet::decode(b"BMSG ABCD he\0llo\n"), Err(ProtocolError::NullByte));
    }

    #[test]
    fn rejects_missing_delimiter()
    {
        assert!(Packet::decode(b"BMSG ABCD hello").is_err());
        assert!(Packet::decode(b"IINF x").is_err());
        assert!(Packet::decode(b"HSUP ADBASE").is_err());
    }

    #[test]
    fn rejects_short_frames()
    {
        assert_eq!(Packet::decode(b""), Err(ProtocolError::TooShort(0)));
        assert_eq!(Packet::decode(b"BMS\n"), Err(ProtocolError::TooShort(4)));
        assert!(matches!(Packet::decode(b"BMSG\n"), Err(ProtocolError::ShortCommand("broadcast"))));
        assert!(matches!(Packet::decode(b"DMSG ABCD\n"), Err(ProtocolError::ShortCommand("direct"))));
        assert!(matches!(Packet::decode(b"USCH ABCD\n"), Err(ProtocolError::ShortCommand("udp"))));
    }

    #[test]
    fn rejects_missing_separators()
    {
        assert!(matches!(Packet::decode(b"BMSGABCD hi\n"), Err(ProtocolError::SeparatorExpected(_))));
        assert!(matches!(Packet::decode(b"BMSG ABCDhi\n"), Err(ProtocolError::SeparatorExpected(_))));
        assert!(matches!(
            Packet::decode(b"DMSG ABCD EFGHhi\n"),
            Err(ProtocolError::SeparatorExpected(_))
        ));
    }

    #[test]
    fn rejects_unknown_kind()
    {
        assert_eq!(Packet::decode(b"XMSG hi\n"), Err(ProtocolError::UnknownKind('X')));
    }

    #[test]
    fn rejects_short_feature_token()
    {
        assert!(matches!(Packet::decode(b"FSCH ABCD +TC\n"), Err(ProtocolError::ShortFeature(_))));
    }

    #[test]
    fn rejects_bad_cid()
    {
        let bad = "1".repeat(39);
        let frame = format!("USCH {} x\n", bad).into_bytes();
        assert!(matches!(Packet::decode(&frame), Err(ProtocolError::InvalidCid(_))));
    }

    #[test]
    fn payload_may_contain_inner_structure()
    {
        let packet = roundtrip(b"DCTM AAAB AAAC ADC/1.0 3000 TOKEN\n");
        let Packet::Direct(p) = packet else { panic!("wrong kind") };
        assert_eq!(p.name, CmdName::CTM);
        assert_eq!(p.data, b"ADC/1.0 3000 TOKEN");
    }

    mod properties
    {
        use super::*;
        use proptest::prelude::*;

        fn arb_payload() -> impl Strategy<Value = Vec<u8>>
        {
            // anything except NUL and the frame delimiter
            proptest::collection::vec((1u8..=255).prop_filter("no LF", |b| *b != LINE_DELIM), 0..64)
                .prop_filter("no leading space", |v| v.first() != Some(&b' '))
        }

        fn arb_name() -> impl Strategy<Value = CmdName>
        {
            proptest::array::uniform3(b'A'..=b'Z').prop_map(CmdName)
        }

        fn arb_sid() -> impl Strategy<Value = Sid>
        {
            (0u32..=Sid::MAX_VALUE).prop_map(Sid::new)
        }

        fn arb_features() -> impl Strategy<Value = std::collections::BTreeMap<Feature, bool>>
        {
            proptest::collection::btree_map(
                proptest::array::uniform4(b'A'..=b'Z').prop_map(Feature::from_bytes),
                proptest::bool::ANY,
                0..4,
            )
        }

        proptest! {
            #[test]
            fn broadcast_roundtrips(name in arb_name(), id in arb_sid(), data in arb_payload())
            {
                let packet = Packet::Broadcast(BroadcastPacket { name, id, data });
                prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
            }

            #[test]
            fn direct_roundtrips(name in arb_name(), id in arb_sid(), targ in arb_sid(), data in arb_payload())
            {
                let packet = Packet::Direct(DirectPacket { name, id, targ, data });
                prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
            }

            #[test]
            fn feature_roundtrips(name in arb_name(), id in arb_sid(), features in arb_features(),
                                  data in "[A-Za-z0-9:]{0,20}")
            {
                let packet = Packet::Feature(FeaturePacket {
                    name, id, features, data: data.into_bytes(),
                });
                prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
            }

            #[test]
            fn info_roundtrips(name in arb_name(), data in arb_payload())
            {
                let packet = Packet::Info(InfoPacket { name, data });
                prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
            }
        }
    }
}
