use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dc_proto::{Cid, Feature, Sid};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tracing::trace;

use crate::config::Software;
use crate::errors::PeerError;
use crate::hub::Hub;
use crate::name::Nickname;
use crate::room::Room;

static SEND_QUEUE_LEN: usize = 100;

/// Per-message deadline while a connection is handshaking.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The wire protocol a peer connected with.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Protocol
{
    Adc,
    Irc,
    Nmdc,
}

impl fmt::Display for Protocol
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self {
            Protocol::Adc => "ADC".fmt(f),
            Protocol::Irc => "IRC".fmt(f),
            Protocol::Nmdc => "NMDC".fmt(f),
        }
    }
}

/// The identity a peer presents to the rest of the hub.
#[derive(Clone,Debug)]
pub struct UserInfo
{
    pub name: Nickname,
    pub app: Software,
    pub cid: Option<Cid>,
    pub features: Vec<Feature>,
}

/// A chat message. `name` is the sender's nickname at send time; the hub
/// does not rewrite it on relay.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Message
{
    pub name: String,
    pub text: String,
}

/// A search request as relayed between peers. ADC-origin requests keep the
/// raw payload so same-protocol relay is byte-faithful; the structured
/// fields let the other adapters re-express it.
#[derive(Clone,Debug,Default)]
pub struct SearchRequest
{
    pub tth: Option<String>,
    pub terms: Vec<String>,
    pub adc_raw: Option<Vec<u8>>,
}

/// The uniform capability set every protocol adapter implements.
///
/// Operations translate hub events into wire frames and enqueue them on the
/// peer's send queue; they never block on the network and are never called
/// with the directory lock held by the callee.
pub trait Peer: Send + Sync + 'static
{
    fn sid(&self) -> Sid;
    fn name(&self) -> Nickname;
    fn user(&self) -> UserInfo;
    fn protocol(&self) -> Protocol;
    fn remote_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;

    /// Whether this peer can take part in client-to-client connections.
    fn can_connect(&self) -> bool
    {
        false
    }

    /// Whether search requests can be delivered to this peer.
    fn can_search(&self) -> bool
    {
        false
    }

    /// Announces the given peers as present to this peer.
    fn peers_join(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>;

    /// Announces the given peers as departed.
    fn peers_leave(&self, peers: &[Arc<dyn Peer>]) -> Result<(), PeerError>;

    /// Delivers a public chat message.
    fn chat_msg(&self, room: &Room, from: &Arc<dyn Peer>, msg: &Message) -> Result<(), PeerError>;

    /// Delivers a private message addressed to this peer.
    fn private_msg(&self, from: &Arc<dyn Peer>, msg: &Message) -> Result<(), PeerError>;

    /// Delivers a message spoken by the hub itself.
    fn hub_chat_msg(&self, text: &str) -> Result<(), PeerError>;

    /// Asks this peer's client to connect to `from` at `addr`.
    fn connect_to(&self, from: &Arc<dyn Peer>, addr: &str, token: &str, secure: bool)
        -> Result<(), PeerError>;

    /// Asks this peer's client to request a connection from `from`.
    fn rev_connect_to(&self, from: &Arc<dyn Peer>, token: &str, secure: bool)
        -> Result<(), PeerError>;

    /// Delivers a search request originated by `from`.
    fn search(&self, req: &SearchRequest, from: &Arc<dyn Peer>) -> Result<(), PeerError>;

    fn join_room(&self, room: &Room) -> Result<(), PeerError>;
    fn leave_room(&self, room: &Room) -> Result<(), PeerError>;

    /// Closes the connection and leaves the hub. Idempotent.
    fn close(&self);

    /// Escape hatch for adapters that render other peers of their own
    /// protocol with higher fidelity.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Fields shared by every adapter variant.
pub(crate) struct PeerCore
{
    pub hub: Arc<Hub>,
    pub sid: Sid,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub sender: FrameSender,
    pub close_signal: Arc<Notify>,
    closed: AtomicBool,
}

impl PeerCore
{
    pub fn new(hub: Arc<Hub>, sid: Sid, remote_addr: SocketAddr, local_addr: SocketAddr,
               sender: FrameSender, close_signal: Arc<Notify>) -> Self
    {
        Self {
            hub,
            sid,
            remote_addr,
            local_addr,
            sender,
            close_signal,
            closed: AtomicBool::new(false),
        }
    }

    /// Flips the close guard. Returns true exactly once.
    pub fn begin_close(&self) -> bool
    {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool
    {
        self.closed.load(Ordering::SeqCst)
    }

    /// The common close path: stop the writer, wake the reader, leave the
    /// hub. Adapters call this from their `close()`.
    pub fn close_with(&self, name: &Nickname)
    {
        if self.begin_close() {
            self.sender.close();
            self.close_signal.notify_one();
            self.hub.leave(self.sid, name, None);
        }
    }
}

enum OutFrame
{
    Data(Vec<u8>),
    Shutdown,
}

/// Handle to a peer's outbound queue. Frames are written whole and in
/// submission order by the writer task, which gives each connection frame
/// atomicity without a mutex around the socket.
#[derive(Clone)]
pub(crate) struct FrameSender
{
    tx: mpsc::Sender<OutFrame>,
}

impl FrameSender
{
    pub fn send(&self, frame: Vec<u8>) -> Result<(), PeerError>
    {
        self.tx.try_send(OutFrame::Data(frame)).map_err(|e| match e {
            TrySendError::Full(_) => PeerError::SendQueueFull,
            TrySendError::Closed(_) => PeerError::Closed,
        })
    }

    /// Queues a writer shutdown behind any pending frames.
    pub fn close(&self)
    {
        let _ = self.tx.try_send(OutFrame::Shutdown);
    }
}

/// Spawns the task that owns a connection's write half. Write failure wakes
/// the reader through `close_signal` so the connection is torn down.
pub(crate) fn spawn_writer<W>(mut writer: W, close_signal: Arc<Notify>) -> FrameSender
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(SEND_QUEUE_LEN);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutFrame::Data(bytes) => {
                    if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                        break;
                    }
                    trace!("sent {} bytes", bytes.len());
                }
                OutFrame::Shutdown => break,
            }
        }
        let _ = writer.shutdown().await;
        close_signal.notify_one();
    });
    FrameSender { tx }
}
