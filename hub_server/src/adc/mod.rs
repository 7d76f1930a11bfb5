//! The ADC peer adapter and the hub side of the ADC handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use dc_proto::{escape, field_value, unescape, BroadcastPacket, Cid, CmdName, DirectPacket,
               EchoPacket, Feature, FeaturePacket, InfoPacket, Packet, Sid};
use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info};

use crate::config::Software;
use crate::errors::{HandshakeError, HubError, PeerError, RegistryError};
use crate::hub::Hub;
use crate::name::Nickname;
use crate::peer::{spawn_writer, FrameSender, Message as ChatMessage, Peer, PeerCore, Protocol,
                  SearchRequest, UserInfo, HANDSHAKE_TIMEOUT};
use crate::room::Room;

/// The features the hub itself announces in `ISUP`.
const HUB_SUPPORTS: &[u8] = b"ADBASE ADTIGR";

impl Hub
{
    /// Serves one ADC connection to completion.
    pub async fn serve_adc<S>(self: &Arc<Self>, stream: S, remote_addr: SocketAddr,
                              local_addr: SocketAddr) -> Result<(), HubError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.count_connection(Protocol::Adc);
        info!("{}: using ADC", remote_addr);

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let close_signal = Arc::new(tokio::sync::Notify::new());
        let sender = spawn_writer(writer, close_signal.clone());

        let peer = match self
            .adc_handshake(&mut reader, &sender, &close_signal, remote_addr, local_addr)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                sender.close();
                return Err(e.into());
            }
        };

        let result = self.adc_serve(&peer, &mut reader).await;
        peer.close();
        result
    }

    /// `HSUP`/`ISUP`, then the identity exchange: the client's `BINF` names
    /// it and is validated and reserved, `ISID` assigns its session, and its
    /// confirming `BINF` promotes it.
    async fn adc_handshake<R>(self: &Arc<Self>, reader: &mut R, sender: &FrameSender,
                              close_signal: &Arc<tokio::sync::Notify>, remote_addr: SocketAddr,
                              local_addr: SocketAddr) -> Result<Arc<AdcPeer>, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let packet = read_packet_timeout(reader, "HSUP").await?;
        let sup_ok = matches!(&packet, Packet::Hub(p) if p.name == CmdName::SUP);
        if !sup_ok {
            return Err(unexpected("HSUP", &packet));
        }
        send_packet(sender, &Packet::Info(InfoPacket {
            name: CmdName::SUP,
            data: HUB_SUPPORTS.to_vec(),
        }))?;

        let packet = read_packet_timeout(reader, "BINF").await?;
        let inf = match packet {
            Packet::Broadcast(p) if p.name == CmdName::INF => p,
            other => return Err(unexpected("BINF", &other)),
        };
        let payload = String::from_utf8_lossy(&inf.data).into_owned();
        let cid_str = field_value(&payload, "ID").ok_or(HandshakeError::Unexpected {
            expected: "an identity carrying ID",
            got: payload.clone(),
        })?;
        let cid = Cid::from_base32(&cid_str)?;
        if field_value(&payload, "PD").is_none() {
            return Err(HandshakeError::Unexpected {
                expected: "an identity carrying PD",
                got: payload.clone(),
            });
        }
        let requested = field_value(&payload, "NI").ok_or(HandshakeError::Unexpected {
            expected: "an identity carrying NI",
            got: payload.clone(),
        })?;

        let nick = match Nickname::new(requested) {
            Ok(nick) => nick,
            Err(e) => {
                send_status(sender, "221", &e.to_string())?;
                return Err(RegistryError::from(e).into());
            }
        };
        let reservation = match self.reserve_name(nick.clone(), Protocol::Adc) {
            Ok(reservation) => reservation,
            Err(e) => {
                send_status(sender, status_code(&e), &e.to_string())?;
                return Err(e.into());
            }
        };
        let sid = match self.sids.next() {
            Ok(sid) => sid,
            Err(e) => {
                send_status(sender, status_code(&e), &e.to_string())?;
                return Err(e.into());
            }
        };

        let accept = self
            .adc_accept(reader, sender, close_signal, remote_addr, local_addr, nick, cid, sid)
            .await;
        let peer = match accept {
            Ok(peer) => peer,
            Err(e) => {
                self.sids.release(sid);
                return Err(e);
            }
        };

        let dyn_peer: Arc<dyn Peer> = peer.clone();
        self.accept_peer(reservation, dyn_peer);
        if let Err(e) = self.adc_enter(&peer) {
            // already promoted, so tear down through the ordinary leave path
            peer.close();
            return Err(e.into());
        }
        Ok(peer)
    }

    /// Replays presence to a freshly promoted ADC peer. The roster after
    /// promotion includes the new session itself, confirming its own BINF
    /// with the assigned SID.
    fn adc_enter(&self, peer: &Arc<AdcPeer>) -> Result<(), PeerError>
    {
        peer.peers_join(&self.peers())?;
        let motd = &self.config().motd;
        if motd.is_empty() {
            peer.hub_chat_msg(&format!("Welcome to {}", self.config().name))
        } else {
            peer.hub_chat_msg(motd)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn adc_accept<R>(self: &Arc<Self>, reader: &mut R, sender: &FrameSender,
                           close_signal: &Arc<tokio::sync::Notify>, remote_addr: SocketAddr,
                           local_addr: SocketAddr, nick: Nickname, cid: Cid, sid: Sid)
        -> Result<Arc<AdcPeer>, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        send_packet(sender, &Packet::Info(InfoPacket {
            name: CmdName::SID,
            data: sid.to_string().into_bytes(),
        }))?;
        let conf = self.config();
        send_packet(sender, &Packet::Info(InfoPacket {
            name: CmdName::INF,
            data: format!("CT32 NI{} VE{} DE{}",
                          escape(&conf.name), escape(&conf.soft.to_string()), escape(&conf.desc))
                .into_bytes(),
        }))?;

        let packet = read_packet_timeout(reader, "BINF").await?;
        let inf = match packet {
            Packet::Broadcast(p) if p.name == CmdName::INF => p,
            other => return Err(unexpected("BINF", &other)),
        };
        if inf.id != sid {
            return Err(HandshakeError::Unexpected {
                expected: "an identity sourced from the assigned SID",
                got: inf.id.to_string(),
            });
        }

        let payload = String::from_utf8_lossy(&inf.data).into_owned();
        let features = field_value(&payload, "SU")
            .map(|su| su.split(',').filter_map(|t| t.parse().ok()).collect())
            .unwrap_or_default();
        let app = field_value(&payload, "VE").unwrap_or_default();

        Ok(Arc::new(AdcPeer {
            core: PeerCore::new(self.clone(), sid, remote_addr, local_addr, sender.clone(),
                                close_signal.clone()),
            name: RwLock::new(nick),
            cid,
            app,
            features,
            inf: RwLock::new(inf.data),
        }))
    }

    async fn adc_serve<R>(&self, peer: &Arc<AdcPeer>, reader: &mut R) -> Result<(), HubError>
    where
        R: AsyncBufRead + Unpin,
    {
        let dyn_peer: Arc<dyn Peer> = peer.clone();
        loop {
            let frame = tokio::select! {
                _ = peer.core.close_signal.notified() => return Ok(()),
                frame = read_frame(reader) => frame?,
            };
            let Some(frame) = frame else { return Ok(()) };
            let packet = Packet::decode(&frame)?;

            // a client may only speak for its own session
            if packet.source().is_some_and(|src| src != peer.core.sid) {
                debug!("{}: dropping frame with spoofed source {}", peer.core.remote_addr,
                       packet.source().unwrap_or(Sid::HUB));
                continue;
            }

            match packet {
                Packet::Broadcast(p) => self.adc_broadcast(peer, &dyn_peer, p),
                Packet::Direct(p) => {
                    self.adc_direct(peer, &dyn_peer, DirectFrame::from_direct(&p), false)
                }
                Packet::Echo(p) => {
                    self.adc_direct(peer, &dyn_peer, DirectFrame::from_echo(&p), true)
                }
                Packet::Feature(p) => self.adc_feature(peer, &dyn_peer, p),
                Packet::Hub(p) => {
                    debug!("{}: ignoring H{} in steady state", peer.core.remote_addr, p.name);
                }
                other => {
                    debug!("{}: ignoring {} frame", peer.core.remote_addr, other.kind() as char);
                }
            }
        }
    }

    fn adc_broadcast(&self, peer: &Arc<AdcPeer>, dyn_peer: &Arc<dyn Peer>, p: BroadcastPacket)
    {
        match p.name {
            CmdName::MSG => {
                let text = unescape(&String::from_utf8_lossy(&p.data));
                self.global_chat.send_chat(dyn_peer, &text);
            }
            CmdName::INF => {
                *peer.inf.write() = p.data.clone();
                self.relay_to_adc(peer, &Packet::Broadcast(p));
            }
            CmdName::SCH => {
                let req = search_request(&p.data);
                self.route_search(dyn_peer, &req);
            }
            _ => self.relay_to_adc(peer, &Packet::Broadcast(p)),
        }
    }

    fn adc_direct(&self, peer: &Arc<AdcPeer>, dyn_peer: &Arc<dyn Peer>, frame: DirectFrame,
                  echo: bool)
    {
        let Some(target) = self.peer_by_sid(frame.targ) else {
            debug!("{}: {} to unknown session {}", peer.core.remote_addr, frame.name, frame.targ);
            return;
        };
        let data = String::from_utf8_lossy(&frame.data).into_owned();
        match frame.name {
            CmdName::MSG => {
                let text = unescape(data.split(' ').next().unwrap_or_default());
                let msg = ChatMessage { name: peer.name().to_string(), text };
                if let Err(e) = target.private_msg(dyn_peer, &msg) {
                    debug!("private message to {} failed: {}", target.name(), e);
                }
            }
            CmdName::CTM => {
                let mut args = data.split(' ');
                let proto = args.next().unwrap_or_default();
                let port = args.next().unwrap_or_default();
                let token = args.next().unwrap_or_default();
                let addr = format!("{}:{}", peer.core.remote_addr.ip(), port);
                self.route_connect(dyn_peer, &target, &addr, token, proto.starts_with("ADCS"));
            }
            CmdName::RCM => {
                let mut args = data.split(' ');
                let proto = args.next().unwrap_or_default();
                let token = args.next().unwrap_or_default();
                self.route_rev_connect(dyn_peer, &target, token, proto.starts_with("ADCS"));
            }
            _ => {
                // RES and anything else: deliverable to ADC peers only
                if let Some(adc) = target.as_any().downcast_ref::<AdcPeer>() {
                    let _ = adc.send_packet(&frame.to_packet(echo));
                }
            }
        }
        if echo {
            let _ = peer.send_packet(&frame.to_packet(true));
        }
    }

    fn adc_feature(&self, peer: &Arc<AdcPeer>, dyn_peer: &Arc<dyn Peer>, p: FeaturePacket)
    {
        let frame = Packet::Feature(p.clone());
        for other in self.peers().iter() {
            if other.sid() == peer.core.sid {
                continue;
            }
            let features = other.user().features;
            let matches = p.features.iter().all(|(f, required)| {
                features.contains(f) == *required
            });
            if !matches {
                continue;
            }
            if let Some(adc) = other.as_any().downcast_ref::<AdcPeer>() {
                let _ = adc.send_packet(&frame);
            } else if p.name == CmdName::SCH {
                let req = search_request(&p.data);
                if other.can_search() {
                    let _ = other.search(&req, dyn_peer);
                }
            }
        }
    }

    /// Relays a frame unchanged to every other ADC peer.
    fn relay_to_adc(&self, from: &Arc<AdcPeer>, packet: &Packet)
    {
        let frame = packet.encode();
        for other in self.peers().iter() {
            if other.sid() == from.core.sid {
                continue;
            }
            if let Some(adc) = other.as_any().downcast_ref::<AdcPeer>() {
                if let Err(e) = adc.core.sender.send(frame.clone()) {
                    debug!("relay to {} failed: {}", other.name(), e);
                }
            }
        }
    }
}

/// The common shape of `D` and `E` frames while they are routed.
struct DirectFrame
{
    name: CmdName,
    id: Sid,
    targ: Sid,
    data: Vec<u8>,
}

impl DirectFrame
{
    fn from_direct(p: &DirectPacket) -> Self
    {
        Self { name: p.name, id: p.id, targ: p.targ, data: p.data.clone() }
    }

    fn from_echo(p: &EchoPacket) -> Self
    {
        Self { name: p.name, id: p.id, targ: p.targ, data: p.data.clone() }
    }

    fn to_packet(&self, echo: bool) -> Packet
    {
        if echo {
            Packet::Echo(EchoPacket {
                name: self.name,
                id: self.id,
                targ: self.targ,
                data: self.data.clone(),
            })
        } else {
            Packet::Direct(DirectPacket {
                name: self.name,
                id: self.id,
                targ: self.targ,
                data: self.data.clone(),
            })
        }
    }
}

/// Builds the routable form of an ADC search payload. The raw payload is
/// kept for byte-faithful relay to other ADC clients.
fn search_request(data: &[u8]) -> SearchRequest
{
    let payload = String::from_utf8_lossy(data).into_owned();
    let terms = dc_proto::fields(&payload)
        .filter(|(tag, _)| *tag == "AN")
        .map(|(_, v)| unescape(v))
        .collect();
    SearchRequest {
        tth: field_value(&payload, "TR"),
        terms,
        adc_raw: Some(data.to_vec()),
    }
}

/// A connected ADC client.
pub(crate) struct AdcPeer
{
    core: PeerCore,
    name: RwLock<Nickname>,
    cid: Cid,
    app: String,
    features: Vec<Feature>,
    /// The INF payload as last sent by the client, relayed verbatim when
    /// other peers are told about this one.
    inf: RwLock<Vec<u8>>,
}

impl AdcPeer
{
    fn send_packet(&self, packet: &Packet) -> Result<(), PeerError>
    {
        self.core.sender.send(packet.encode())
    }

    /// The `BINF` announcing `peer` to this client. Peers on other protocols
    /// get a synthesised identity.
    fn inf_for(&self, peer: &Arc<dyn Peer>) -> BroadcastPacket
    {
        let data = match peer.as_any().downcast_ref::<AdcPeer>() {
            Some(adc) => adc.inf.read().clone(),
            None => {
                let user = peer.user();
                format!("NI{} VE{}", escape(user.name.as_str()), escape(&user.app.to_string()))
                    .into_bytes()
            }
        };
        BroadcastPacket { name: CmdName::INF, id: peer.sid(), data }
    }
}

impl Peer for AdcPeer
{
    fn sid(&self) -> Sid
    {
        self.core.sid
    }

    fn name(&self) -> Nickname
    {
        self.name.read().clone()
    }

    fn user(&self) -> UserInfo
    {
        UserInfo {
            name: self.name(),
            app: Software { name: self.app.clone(), version: String::new() },
            cid: Some(self.cid),
            features: self.features.clone(),
        }
    }

    fn protocol(&self) -> Protocol
    {
        Protocol::Adc
    }

    fn remote_addr(&self) -> SocketAddr
    {
        self.core.remote_addr
    }

    fn local_addr(&self) -> SocketAddr
    {
        self.core.local_addr
    }

    fn can_connect(&self) -> bool
    {
        self.features.contains(&Feature::TCP4)
    }

    fn can_search(&self) -> bool
    {
        true
    }

    fn peers_join(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>
    {
        for peer in peers {
            self.send_packet(&Packet::Broadcast(self.inf_for(peer)))?;
        }
        Ok(())
    }

    fn peers_leave(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>
    {
        for peer in peers {
            self.send_packet(&Packet::Info(InfoPacket {
                name: CmdName::QUI,
                data: peer.sid().to_string().into_bytes(),
            }))?;
        }
        Ok(())
    }

    fn chat_msg(&self, room: &Room, from: &Arc<dyn Peer>, msg: &ChatMessage)
        -> Result<(), PeerError>
    {
        if from.sid() == self.core.sid {
            // no echo
            return Ok(());
        }
        if !room.name().is_empty() {
            return Ok(()); // FIXME: named rooms
        }
        self.send_packet(&Packet::Broadcast(BroadcastPacket {
            name: CmdName::MSG,
            id: from.sid(),
            data: escape(&msg.text).into_bytes(),
        }))
    }

    fn private_msg(&self, from: &Arc<dyn Peer>, msg: &ChatMessage) -> Result<(), PeerError>
    {
        self.send_packet(&Packet::Echo(EchoPacket {
            name: CmdName::MSG,
            id: from.sid(),
            targ: self.core.sid,
            data: format!("{} PM{}", escape(&msg.text), from.sid()).into_bytes(),
        }))
    }

    fn hub_chat_msg(&self, text: &str) -> Result<(), PeerError>
    {
        self.send_packet(&Packet::Info(InfoPacket {
            name: CmdName::MSG,
            data: escape(text).into_bytes(),
        }))
    }

    fn connect_to(&self, from: &Arc<dyn Peer>, addr: &str, token: &str, secure: bool)
        -> Result<(), PeerError>
    {
        let port = addr.rsplit(':').next().unwrap_or_default();
        let proto = if secure { "ADCS/0.10" } else { "ADC/1.0" };
        self.send_packet(&Packet::Direct(DirectPacket {
            name: CmdName::CTM,
            id: from.sid(),
            targ: self.core.sid,
            data: format!("{} {} {}", proto, port, token).into_bytes(),
        }))
    }

    fn rev_connect_to(&self, from: &Arc<dyn Peer>, token: &str, secure: bool)
        -> Result<(), PeerError>
    {
        let proto = if secure { "ADCS/0.10" } else { "ADC/1.0" };
        self.send_packet(&Packet::Direct(DirectPacket {
            name: CmdName::RCM,
            id: from.sid(),
            targ: self.core.sid,
            data: format!("{} {}", proto, token).into_bytes(),
        }))
    }

    fn search(&self, req: &SearchRequest, from: &Arc<dyn Peer>) -> Result<(), PeerError>
    {
        let data = match &req.adc_raw {
            Some(raw) => raw.clone(),
            None => match &req.tth {
                Some(tth) => format!("TR{}", tth).into_bytes(),
                None => req
                    .terms
                    .iter()
                    .map(|t| format!("AN{}", escape(t)))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .into_bytes(),
            },
        };
        self.send_packet(&Packet::Broadcast(BroadcastPacket {
            name: CmdName::SCH,
            id: from.sid(),
            data,
        }))
    }

    fn join_room(&self, _room: &Room) -> Result<(), PeerError>
    {
        Ok(()) // FIXME: named rooms
    }

    fn leave_room(&self, _room: &Room) -> Result<(), PeerError>
    {
        Ok(())
    }

    fn close(&self)
    {
        let name = self.name();
        self.core.close_with(&name);
    }

    fn as_any(&self) -> &dyn std::any::Any
    {
        self
    }
}

fn unexpected(expected: &'static str, packet: &Packet) -> HandshakeError
{
    HandshakeError::Unexpected {
        expected,
        got: format!("{}{}", packet.kind() as char, packet.name()),
    }
}

fn send_packet(sender: &FrameSender, packet: &Packet) -> Result<(), PeerError>
{
    sender.send(packet.encode())
}

/// Reports a fatal handshake failure to the client (`ISTA` severity 2).
fn send_status(sender: &FrameSender, code: &str, text: &str) -> Result<(), PeerError>
{
    send_packet(sender, &Packet::Info(InfoPacket {
        name: CmdName::STA,
        data: format!("{} {}", code, escape(text)).into_bytes(),
    }))
}

fn status_code(e: &RegistryError) -> &'static str
{
    match e {
        RegistryError::NickTaken => "222",
        RegistryError::BadNick(_) => "221",
        RegistryError::SidExhausted => "211",
        _ => "200",
    }
}

/// Reads one newline-terminated frame, delimiter included. `None` is a
/// clean end of stream.
async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    if reader.read_until(b'\n', &mut frame).await? == 0 {
        return Ok(None);
    }
    Ok(Some(frame))
}

async fn read_packet_timeout<R>(reader: &mut R, expected: &'static str)
    -> Result<Packet, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| HandshakeError::Timeout(expected))??
        .ok_or(HandshakeError::Closed)?;
    Ok(Packet::decode(&frame)?)
}
