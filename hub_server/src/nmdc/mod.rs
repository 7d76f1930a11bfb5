//! The NMDC peer adapter: the legacy pipe-framed Direct Connect dialect,
//! plugged into the same membership core as ADC and IRC.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info};

use crate::config::Software;
use crate::errors::{HandshakeError, HubError, PeerError};
use crate::hub::Hub;
use crate::name::Nickname;
use crate::peer::{spawn_writer, FrameSender, Message as ChatMessage, Peer, PeerCore, Protocol,
                  SearchRequest, UserInfo, HANDSHAKE_TIMEOUT};
use crate::room::Room;

impl Hub
{
    /// Serves one NMDC connection to completion.
    pub async fn serve_nmdc<S>(self: &Arc<Self>, stream: S, remote_addr: SocketAddr,
                               local_addr: SocketAddr) -> Result<(), HubError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.count_connection(Protocol::Nmdc);
        info!("{}: using NMDC", remote_addr);

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let close_signal = Arc::new(tokio::sync::Notify::new());
        let sender = spawn_writer(writer, close_signal.clone());

        let peer = match self
            .nmdc_handshake(&mut reader, &sender, &close_signal, remote_addr, local_addr)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                sender.close();
                return Err(e.into());
            }
        };

        let result = self.nmdc_serve(&peer, &mut reader).await;
        peer.close();
        result
    }

    /// `$Lock`, then `$ValidateNick` with the same retry semantics as the
    /// IRC NICK loop, then `$Hello`/`$MyINFO` and promotion.
    async fn nmdc_handshake<R>(self: &Arc<Self>, reader: &mut R, sender: &FrameSender,
                               close_signal: &Arc<tokio::sync::Notify>, remote_addr: SocketAddr,
                               local_addr: SocketAddr) -> Result<Arc<NmdcPeer>, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let soft = &self.config().soft;
        send_line(sender, &format!("$Lock EXTENDEDPROTOCOL_{} Pk={}", soft.name, soft))?;

        let (nick, reservation) = loop {
            let line = read_line_timeout(reader, "$ValidateNick").await?;
            let (command, args) = split_command(&line);
            match command {
                "$Supports" | "$Key" | "$HubName" => continue,
                "$ValidateNick" => {
                    let nick = match Nickname::new(args.to_string()) {
                        Ok(nick) => nick,
                        Err(_) => {
                            send_line(sender, &format!("$ValidateDenide {}", args))?;
                            continue;
                        }
                    };
                    match self.reserve_name(nick.clone(), Protocol::Nmdc) {
                        Ok(reservation) => break (nick, reservation),
                        Err(_) => {
                            send_line(sender, &format!("$ValidateDenide {}", args))?;
                            continue;
                        }
                    }
                }
                _ => {
                    return Err(HandshakeError::Unexpected {
                        expected: "$ValidateNick",
                        got: line,
                    });
                }
            }
        };

        send_line(sender, &format!("$HubName {}", escape_nmdc(&self.config().name)))?;
        send_line(sender, &format!("$Hello {}", nick))?;

        // the client identifies itself before it may enter
        let myinfo = loop {
            let line = read_line_timeout(reader, "$MyINFO").await?;
            let (command, args) = split_command(&line);
            match command {
                "$Version" | "$GetNickList" | "$Supports" => continue,
                "$MyINFO" => {
                    let mut parts = args.splitn(3, ' ');
                    let all = parts.next().unwrap_or_default();
                    let owner = parts.next().unwrap_or_default();
                    if all != "$ALL" || owner != nick.as_str() {
                        return Err(HandshakeError::Unexpected { expected: "$MyINFO $ALL", got: line });
                    }
                    // TODO: validate the remaining MyINFO fields
                    break line;
                }
                _ => {
                    debug!("{}: nmdc: ignoring {} during login", remote_addr, command);
                }
            }
        };

        let sid = self.sids.next()?;
        let peer = Arc::new(NmdcPeer {
            core: PeerCore::new(self.clone(), sid, remote_addr, local_addr, sender.clone(),
                                close_signal.clone()),
            name: RwLock::new(nick),
            myinfo: RwLock::new(myinfo),
        });

        let dyn_peer: Arc<dyn Peer> = peer.clone();
        self.accept_peer(reservation, dyn_peer);
        if let Err(e) = self.nmdc_enter(&peer) {
            // already promoted, so tear down through the ordinary leave path
            peer.close();
            return Err(e.into());
        }
        Ok(peer)
    }

    /// Replays presence to a freshly promoted NMDC peer.
    fn nmdc_enter(&self, peer: &Arc<NmdcPeer>) -> Result<(), PeerError>
    {
        let roster = self.peers();
        peer.peers_join(&roster)?;
        let names: Vec<String> = roster.iter().map(|p| escape_nmdc(p.name().as_str())).collect();
        peer.send_line(&format!("$NickList {}$$", names.join("$$")))?;
        let motd = &self.config().motd;
        if !motd.is_empty() {
            peer.hub_chat_msg(motd)?;
        }
        Ok(())
    }

    async fn nmdc_serve<R>(&self, peer: &Arc<NmdcPeer>, reader: &mut R) -> Result<(), HubError>
    where
        R: AsyncBufRead + Unpin,
    {
        let dyn_peer: Arc<dyn Peer> = peer.clone();
        loop {
            let line = tokio::select! {
                _ = peer.core.close_signal.notified() => return Ok(()),
                line = read_nmdc_line(reader) => line?,
            };
            let Some(line) = line else { return Ok(()) };
            if line.is_empty() {
                continue; // keep-alive
            }

            if let Some(rest) = line.strip_prefix('<') {
                // `<nick> text` goes to the main chat
                if let Some((_, text)) = rest.split_once("> ") {
                    self.global_chat.send_chat(&dyn_peer, text);
                }
                continue;
            }

            let (command, args) = split_command(&line);
            match command {
                "$To:" => {
                    // $To: target From: sender $<sender> text
                    let Some((target, rest)) = args.split_once(' ') else { continue };
                    let Some((_, text)) = rest.split_once("> ") else { continue };
                    if let Ok(target) = Nickname::new(target) {
                        self.private_chat(&dyn_peer, &target, text);
                    }
                }
                "$ConnectToMe" => {
                    let mut parts = args.split(' ');
                    let target = parts.next().unwrap_or_default();
                    let addr = parts.next().unwrap_or_default();
                    let Ok(target) = Nickname::new(target) else { continue };
                    if let Some(target) = self.peer_by_name(&target) {
                        self.route_connect(&dyn_peer, &target, addr, "", false);
                    }
                }
                "$RevConnectToMe" => {
                    let mut parts = args.split(' ');
                    let _sender = parts.next();
                    let target = parts.next().unwrap_or_default();
                    let Ok(target) = Nickname::new(target) else { continue };
                    if let Some(target) = self.peer_by_name(&target) {
                        self.route_rev_connect(&dyn_peer, &target, "", false);
                    }
                }
                "$Search" => {
                    let Some((_origin, query)) = args.split_once(' ') else { continue };
                    let req = nmdc_search_request(query);
                    self.route_search(&dyn_peer, &req);
                }
                "$MyINFO" => {
                    *peer.myinfo.write() = line.clone();
                    for other in self.peers().iter() {
                        if other.sid() != peer.core.sid {
                            let _ = other.peers_join(std::slice::from_ref(&dyn_peer));
                        }
                    }
                }
                "$GetNickList" => {
                    let names: Vec<String> = self
                        .peers()
                        .iter()
                        .map(|p| escape_nmdc(p.name().as_str()))
                        .collect();
                    peer.send_line(&format!("$NickList {}$$", names.join("$$")))?;
                }
                "$Quit" => return Ok(()),
                _ => debug!("{}: nmdc: {}", peer.core.remote_addr, command),
            }
        }
    }
}

/// A connected NMDC client.
pub(crate) struct NmdcPeer
{
    core: PeerCore,
    name: RwLock<Nickname>,
    /// The client's `$MyINFO` line as last sent, relayed verbatim when other
    /// peers are told about this one.
    myinfo: RwLock<String>,
}

impl NmdcPeer
{
    fn send_line(&self, line: &str) -> Result<(), PeerError>
    {
        send_line(&self.core.sender, line)
    }

    /// The `$MyINFO` announcing `peer` to this client; synthesised for peers
    /// on other protocols.
    fn myinfo_for(&self, peer: &Arc<dyn Peer>) -> String
    {
        match peer.as_any().downcast_ref::<NmdcPeer>() {
            Some(p) => p.myinfo.read().clone(),
            None => {
                let user = peer.user();
                format!("$MyINFO $ALL {} {}$ $\u{1}$$0$",
                        escape_nmdc(user.name.as_str()), escape_nmdc(&user.app.to_string()))
            }
        }
    }
}

impl Peer for NmdcPeer
{
    fn sid(&self) -> dc_proto::Sid
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
            app: Software { name: "NMDC client".to_string(), version: String::new() },
            cid: None,
            features: Vec::new(),
        }
    }

    fn protocol(&self) -> Protocol
    {
        Protocol::Nmdc
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
        true
    }

    fn can_search(&self) -> bool
    {
        true
    }

    fn peers_join(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>
    {
        for peer in peers {
            let line = self.myinfo_for(peer);
            self.send_line(&line)?;
        }
        Ok(())
    }

    fn peers_leave(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>
    {
        for peer in peers {
            self.send_line(&format!("$Quit {}", escape_nmdc(peer.name().as_str())))?;
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
        self.send_line(&format!("<{}> {}", escape_nmdc(&msg.name), escape_nmdc(&msg.text)))
    }

    fn private_msg(&self, _from: &Arc<dyn Peer>, msg: &ChatMessage) -> Result<(), PeerError>
    {
        let sender = escape_nmdc(&msg.name);
        self.send_line(&format!("$To: {} From: {} $<{}> {}",
                                escape_nmdc(self.name().as_str()), sender, sender,
                                escape_nmdc(&msg.text)))
    }

    fn hub_chat_msg(&self, text: &str) -> Result<(), PeerError>
    {
        self.send_line(&format!("<{}> {}",
                                escape_nmdc(&self.core.hub.config().name), escape_nmdc(text)))
    }

    fn connect_to(&self, _from: &Arc<dyn Peer>, addr: &str, _token: &str, _secure: bool)
        -> Result<(), PeerError>
    {
        self.send_line(&format!("$ConnectToMe {} {}", escape_nmdc(self.name().as_str()), addr))
    }

    fn rev_connect_to(&self, from: &Arc<dyn Peer>, _token: &str, _secure: bool)
        -> Result<(), PeerError>
    {
        self.send_line(&format!("$RevConnectToMe {} {}",
                                escape_nmdc(from.name().as_str()),
                                escape_nmdc(self.name().as_str())))
    }

    fn search(&self, req: &SearchRequest, from: &Arc<dyn Peer>) -> Result<(), PeerError>
    {
        let query = match &req.tth {
            Some(tth) => format!("F?T?0?9?TTH:{}", tth),
            None => format!("F?T?0?1?{}", req.terms.join("$")),
        };
        self.send_line(&format!("$Search Hub:{} {}", escape_nmdc(from.name().as_str()), query))
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

/// NMDC has no general escape mechanism; the two framing characters are
/// carried as HTML entities.
fn escape_nmdc(s: &str) -> String
{
    s.replace('$', "&#36;").replace('|', "&#124;")
}

fn split_command(line: &str) -> (&str, &str)
{
    match line.find(' ') {
        Some(offset) => (&line[..offset], &line[offset + 1 ..]),
        None => (line, ""),
    }
}

/// Interprets the `<active>?<limit>?<size>?<type>?<pattern>` query form.
fn nmdc_search_request(query: &str) -> SearchRequest
{
    let mut parts = query.splitn(5, '?');
    let _size_restricted = parts.next();
    let _is_max_size = parts.next();
    let _size = parts.next();
    let kind = parts.next().unwrap_or_default();
    let pattern = parts.next().unwrap_or_default();
    if kind == "9" {
        SearchRequest {
            tth: Some(pattern.strip_prefix("TTH:").unwrap_or(pattern).to_string()),
            terms: Vec::new(),
            adc_raw: None,
        }
    } else {
        SearchRequest {
            tth: None,
            terms: pattern.split('$').filter(|t| !t.is_empty()).map(str::to_string).collect(),
            adc_raw: None,
        }
    }
}

fn send_line(sender: &FrameSender, line: &str) -> Result<(), PeerError>
{
    sender.send(format!("{}|", line).into_bytes())
}

/// Reads one pipe-terminated command, stripped of the pipe. `None` is a
/// clean end of stream.
async fn read_nmdc_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    if reader.read_until(b'|', &mut raw).await? == 0 {
        return Ok(None);
    }
    if raw.last() == Some(&b'|') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
}

async fn read_line_timeout<R>(reader: &mut R, expected: &'static str)
    -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, read_nmdc_line(reader))
        .await
        .map_err(|_| HandshakeError::Timeout(expected))??
        .ok_or(HandshakeError::Closed)
}
