//! The IRC bridge: presents IRC clients to the hub as ordinary peers.

pub mod proto;

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info};

use crate::config::Software;
use crate::directory::NameReservation;
use crate::errors::{HandshakeError, HubError, PeerError, RegistryError};
use crate::hub::Hub;
use crate::name::Nickname;
use crate::peer::{spawn_writer, FrameSender, Message as ChatMessage, Peer, PeerCore, Protocol,
                  SearchRequest, UserInfo, HANDSHAKE_TIMEOUT};
use crate::room::Room;

use proto::{Message, Prefix};

/// The single public channel the hub is bridged into.
pub const HUB_CHANNEL: &str = "#hub";

impl Hub
{
    /// Serves one IRC connection to completion: handshake, steady state,
    /// leave. Returns when the connection is gone.
    pub async fn serve_irc<S>(self: &Arc<Self>, stream: S, remote_addr: SocketAddr,
                              local_addr: SocketAddr) -> Result<(), HubError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.count_connection(Protocol::Irc);
        info!("{}: using IRC", remote_addr);

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let close_signal = Arc::new(tokio::sync::Notify::new());
        let sender = spawn_writer(writer, close_signal.clone());

        let peer = match self
            .irc_handshake(&mut reader, &sender, &close_signal, remote_addr, local_addr)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                sender.close();
                return Err(e.into());
            }
        };

        let result = self.irc_serve(&peer, &mut reader).await;
        peer.close();
        result
    }

    /// Runs the NICK/USER loop until a name is reserved, then the welcome
    /// and JOIN exchange. The reservation is released automatically on any
    /// failure path.
    async fn irc_handshake<R>(self: &Arc<Self>, reader: &mut R, sender: &FrameSender,
                              close_signal: &Arc<tokio::sync::Notify>, remote_addr: SocketAddr,
                              local_addr: SocketAddr) -> Result<Arc<IrcPeer>, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let host = local_addr.ip().to_string();
        let host_prefix = Prefix::server(&host);
        let mut user = String::new();
        let mut got_user = false;

        let (nick, reservation) = loop {
            let m = read_message_timeout(reader, "NICK").await?;
            if m.command != "NICK" || m.params.len() != 1 {
                return Err(HandshakeError::Unexpected { expected: "NICK", got: m.to_line() });
            }
            let requested = m.params[0].clone();

            if !got_user {
                // the USER command is only expected on the first attempt
                let m = read_message_timeout(reader, "USER").await?;
                if m.command != "USER" || m.params.len() != 4 {
                    return Err(HandshakeError::Unexpected { expected: "USER", got: m.to_line() });
                }
                // TODO: verify params?
                user = m.params[0].clone();
                got_user = true;
            }

            let rejected = |reason: String| {
                Message::with_prefix(host_prefix.clone(), "433",
                                     vec!["*".to_string(), requested.clone(), reason])
            };
            let nick = match Nickname::new(requested.clone()) {
                Ok(nick) => nick,
                Err(e) => {
                    send_message(sender, &rejected(e.to_string()))?;
                    continue;
                }
            };
            if !self.directory.available(&nick, None) {
                send_message(sender, &rejected(RegistryError::NickTaken.to_string()))?;
                continue;
            }
            match self.reserve_name(nick.clone(), Protocol::Irc) {
                Ok(reservation) => break (nick, reservation),
                Err(e) => {
                    send_message(sender, &rejected(e.to_string()))?;
                    continue;
                }
            }
        };

        let sid = self.sids.next()?;
        let peer = Arc::new(IrcPeer {
            core: PeerCore::new(self.clone(), sid, remote_addr, local_addr, sender.clone(),
                                close_signal.clone()),
            own_prefix: Prefix::user(nick.as_str(), &user, &host),
            host_prefix,
            name: RwLock::new(nick),
        });

        match self.irc_accept(&peer, reader, reservation).await {
            Ok(()) => Ok(peer),
            Err(e) => {
                self.sids.release(sid);
                Err(e)
            }
        }
    }

    /// Sends the welcome numerics, waits for `JOIN #hub`, replays the
    /// presence roster and promotes the reservation.
    async fn irc_accept<R>(self: &Arc<Self>, peer: &Arc<IrcPeer>, reader: &mut R,
                           reservation: NameReservation) -> Result<(), HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let nick = peer.name().to_string();
        let host = peer.core.local_addr.ip().to_string();
        let port = peer.core.local_addr.port();
        let vers = self.config().soft.to_string();

        let numeric = |code: &str, params: Vec<String>| {
            Message::with_prefix(peer.host_prefix.clone(), code, params)
        };
        peer.send_message(&numeric("001", vec![
            nick.clone(),
            format!("Welcome to the {} Internet Relay Chat Network {}", self.config().name, nick),
        ]))?;
        peer.send_message(&numeric("002", vec![
            nick.clone(),
            format!("Your host is {}[{}/{}], running version {}", host, host, port, vers),
        ]))?;
        peer.send_message(&numeric("003", vec![
            nick.clone(),
            format!("This server was created {} at {} UTC",
                    self.created().format("%a %b %-d %Y"),
                    self.created().format("%H:%M:%S")),
        ]))?;
        peer.send_message(&numeric("004", vec![
            nick.clone(),
            host,
            vers,
            "DOQRSZaghilopswz".to_string(),
            "CFILMPQSbcefgijklmnopqrstvz".to_string(),
            "bkloveqjfI".to_string(),
        ]))?;
        let isupport = [
            "CHANTYPES=#", "EXCEPTS", "INVEX",
            "CHANMODES=eIbq,k,flj,CFLMPQScgimnprstz",
            "CHANLIMIT=#:120", "PREFIX=(ov)@+", "MAXLIST=bqeI:100",
            "MODES=4", "NETWORK=freenode", "STATUSMSG=@+",
            "CALLERID=g", "CASEMAPPING=rfc1459",
            "are supported by this server",
        ];
        let mut params = vec![nick.clone()];
        params.extend(isupport.iter().map(|s| s.to_string()));
        peer.send_message(&numeric("005", params))?;

        // wait until the user joins the hub channel; no deadline here
        loop {
            let line = read_line(reader).await?.ok_or(HandshakeError::Closed)?;
            let Some(m) = Message::parse(&line) else { continue };
            match m.command.as_str() {
                "PING" => peer.send_message(&Message::new("PONG", m.params))?,
                "JOIN" => {
                    if m.params.len() != 1 {
                        return Err(HandshakeError::Unexpected {
                            expected: "a channel name",
                            got: line,
                        });
                    }
                    if m.params[0] != HUB_CHANNEL {
                        return Err(HandshakeError::Unexpected {
                            expected: HUB_CHANNEL,
                            got: m.params[0].clone(),
                        });
                    }
                    break;
                }
                _ => debug!("{}: unknown command during login: {}", peer.core.remote_addr, line),
            }
        }

        peer.send_message(&Message::with_prefix(peer.own_prefix.clone(), "JOIN",
                                                vec![HUB_CHANNEL.to_string()]))?;
        peer.peers_join(&self.peers())?;

        let dyn_peer: Arc<dyn Peer> = peer.clone();
        self.accept_peer(reservation, dyn_peer);
        Ok(())
    }

    async fn irc_serve<R>(&self, peer: &Arc<IrcPeer>, reader: &mut R) -> Result<(), HubError>
    where
        R: AsyncBufRead + Unpin,
    {
        let dyn_peer: Arc<dyn Peer> = peer.clone();
        loop {
            let line = tokio::select! {
                _ = peer.core.close_signal.notified() => return Ok(()),
                line = read_line(reader) => line?,
            };
            let Some(line) = line else { return Ok(()) };
            let Some(m) = Message::parse(&line) else { continue };
            match m.command.as_str() {
                "PING" => peer.send_message(&Message::new("PONG", m.params))?,
                "PRIVMSG" => {
                    if m.params.len() != 2 {
                        return Err(HubError::InvalidCommand(line));
                    }
                    let text = &m.params[1];
                    if m.params[0] == HUB_CHANNEL {
                        self.global_chat.send_chat(&dyn_peer, text);
                    } else if let Ok(target) = Nickname::new(m.params[0].clone()) {
                        self.private_chat(&dyn_peer, &target, text);
                    }
                }
                "QUIT" => return Ok(()),
                _ => debug!("{}: irc: {}", peer.core.remote_addr, line),
            }
        }
    }
}

/// A connected IRC client, bridged into the hub.
pub(crate) struct IrcPeer
{
    core: PeerCore,
    host_prefix: Prefix,
    own_prefix: Prefix,
    name: RwLock<Nickname>,
}

impl IrcPeer
{
    fn send_message(&self, msg: &Message) -> Result<(), PeerError>
    {
        send_message(&self.core.sender, msg)
    }

    /// The prefix another peer appears under to this client. Peers on other
    /// protocols are synthesised as `name!name@<hub host>`.
    fn prefix_for(&self, from: &Arc<dyn Peer>, name: &str) -> Prefix
    {
        match from.as_any().downcast_ref::<IrcPeer>() {
            Some(p) => p.own_prefix.clone(),
            None => Prefix::user(name, name, &self.host_prefix.name),
        }
    }
}

fn send_message(sender: &FrameSender, msg: &Message) -> Result<(), PeerError>
{
    sender.send(format!("{}\r\n", msg.to_line()).into_bytes())
}

impl Peer for IrcPeer
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
            // TODO: propagate the real IRC client version
            app: Software {
                name: "DC-IRC bridge".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            cid: None,
            features: Vec::new(),
        }
    }

    fn protocol(&self) -> Protocol
    {
        Protocol::Irc
    }

    fn remote_addr(&self) -> SocketAddr
    {
        self.core.remote_addr
    }

    fn local_addr(&self) -> SocketAddr
    {
        self.core.local_addr
    }

    fn peers_join(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>
    {
        for peer in peers {
            let prefix = self.prefix_for(peer, peer.name().as_str());
            self.send_message(&Message::with_prefix(prefix, "JOIN",
                                                    vec![HUB_CHANNEL.to_string()]))?;
        }
        Ok(())
    }

    fn peers_leave(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>
    {
        for peer in peers {
            let prefix = self.prefix_for(peer, peer.name().as_str());
            self.send_message(&Message::with_prefix(prefix, "PART",
                                                    vec![HUB_CHANNEL.to_string(),
                                                         "disconnect".to_string()]))?;
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
        let prefix = self.prefix_for(from, &msg.name);
        self.send_message(&Message::with_prefix(prefix, "PRIVMSG",
                                                vec![HUB_CHANNEL.to_string(), msg.text.clone()]))
    }

    fn private_msg(&self, from: &Arc<dyn Peer>, msg: &ChatMessage) -> Result<(), PeerError>
    {
        let prefix = self.prefix_for(from, &msg.name);
        self.send_message(&Message::with_prefix(prefix, "PRIVMSG",
                                                vec![self.name().to_string(), msg.text.clone()]))
    }

    fn hub_chat_msg(&self, _text: &str) -> Result<(), PeerError>
    {
        Ok(())
    }

    fn connect_to(&self, _from: &Arc<dyn Peer>, _addr: &str, _token: &str, _secure: bool)
        -> Result<(), PeerError>
    {
        Ok(()) // no client-to-client transfers over the bridge
    }

    fn rev_connect_to(&self, _from: &Arc<dyn Peer>, _token: &str, _secure: bool)
        -> Result<(), PeerError>
    {
        Ok(())
    }

    fn search(&self, _req: &SearchRequest, _from: &Arc<dyn Peer>) -> Result<(), PeerError>
    {
        Ok(())
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

/// Reads one line, stripped of CR/LF. `None` means a clean end of stream.
async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn read_message_timeout<R>(reader: &mut R, expected: &'static str)
    -> Result<Message, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_line(reader))
        .await
        .map_err(|_| HandshakeError::Timeout(expected))??
        .ok_or(HandshakeError::Closed)?;
    Message::parse(&line).ok_or(HandshakeError::Unexpected { expected, got: line })
}
