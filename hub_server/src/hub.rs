use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dc_proto::Sid;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::directory::{NameReservation, PeerDirectory};
use crate::errors::{RegistryError, UserDbError};
use crate::name::Nickname;
use crate::peer::{Peer, Protocol};
use crate::room::Room;
use crate::sid::SidAllocator;
use crate::users::UserDatabase;

/// Owns the membership state and orchestrates handshake, accept, serve and
/// leave for every protocol. One instance per process, shared behind [`Arc`].
pub struct Hub
{
    config: HubConfig,
    created: DateTime<Utc>,
    pub(crate) directory: Arc<PeerDirectory>,
    pub(crate) sids: SidAllocator,
    pub(crate) global_chat: Room,
    user_db: Option<Arc<dyn UserDatabase>>,
    stats: HubStats,
}

#[derive(Default)]
pub(crate) struct HubStats
{
    pub peers: AtomicUsize,
    pub conns_adc: AtomicUsize,
    pub conns_irc: AtomicUsize,
    pub conns_nmdc: AtomicUsize,
}

impl Hub
{
    pub fn new(config: HubConfig, user_db: Option<Arc<dyn UserDatabase>>) -> Arc<Self>
    {
        Arc::new(Self {
            config,
            created: Utc::now(),
            directory: Arc::new(PeerDirectory::new()),
            sids: SidAllocator::new(),
            global_chat: Room::new(""),
            user_db,
            stats: HubStats::default(),
        })
    }

    pub fn config(&self) -> &HubConfig
    {
        &self.config
    }

    pub fn created(&self) -> DateTime<Utc>
    {
        self.created
    }

    pub fn global_chat(&self) -> &Room
    {
        &self.global_chat
    }

    pub fn peer_by_name(&self, name: &Nickname) -> Option<Arc<dyn Peer>>
    {
        self.directory.by_name(name)
    }

    pub fn peer_by_sid(&self, sid: Sid) -> Option<Arc<dyn Peer>>
    {
        self.directory.by_sid(sid)
    }

    /// The current ordered list of live peers.
    pub fn peers(&self) -> Arc<[Arc<dyn Peer>]>
    {
        self.directory.snapshot()
    }

    pub fn peer_count(&self) -> usize
    {
        self.directory.len()
    }

    pub(crate) fn count_connection(&self, proto: Protocol) -> usize
    {
        let counter = match proto {
            Protocol::Adc => &self.stats.conns_adc,
            Protocol::Irc => &self.stats.conns_irc,
            Protocol::Nmdc => &self.stats.conns_nmdc,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reserve_name(&self, name: Nickname, proto: Protocol)
        -> Result<NameReservation, RegistryError>
    {
        self.directory.reserve(name, proto)
    }

    /// Promotes a finished handshake to a live peer and announces the join
    /// to everyone else. The fan-out happens after the directory lock is
    /// released.
    pub(crate) fn accept_peer(&self, reservation: NameReservation, peer: Arc<dyn Peer>)
    {
        let name = reservation.name().clone();
        let notify = self.directory.promote(reservation, peer.clone(), &self.global_chat);
        self.stats.peers.fetch_add(1, Ordering::Relaxed);
        info!("{}: {} joined as {} ({})", peer.remote_addr(), name, peer.sid(), peer.protocol());

        for other in notify.iter() {
            if other.sid() == peer.sid() {
                continue;
            }
            if let Err(e) = other.peers_join(std::slice::from_ref(&peer)) {
                debug!("join announcement to {} failed: {}", other.name(), e);
            }
        }
    }

    /// Removes a peer and broadcasts the departure to the peers present at
    /// removal time. Safe to call more than once, and for sessions that
    /// never completed their handshake.
    pub(crate) fn leave(&self, sid: Sid, name: &Nickname, reason: Option<&str>)
    {
        let Some((peer, notify)) = self.directory.remove(sid, name, &self.global_chat) else {
            return;
        };
        self.stats.peers.fetch_sub(1, Ordering::Relaxed);
        self.sids.release(sid);
        info!("{}: {} left ({})", peer.remote_addr(), name, reason.unwrap_or("disconnect"));

        for other in notify.iter() {
            if let Err(e) = other.peers_leave(std::slice::from_ref(&peer)) {
                debug!("leave announcement to {} failed: {}", other.name(), e);
            }
        }
    }

    /// Sends a message spoken by the hub to every connected peer.
    pub fn hub_chat(&self, text: &str)
    {
        for peer in self.peers().iter() {
            if let Err(e) = peer.hub_chat_msg(text) {
                debug!("hub chat to {} failed: {}", peer.name(), e);
            }
        }
    }

    pub fn register_user(&self, name: &str, pass: &str) -> Result<(), RegistryError>
    {
        let Some(db) = &self.user_db else {
            return Err(RegistryError::RegistrationDisabled);
        };
        Ok(db.register_user(name, pass)?)
    }

    pub fn is_registered(&self, name: &str) -> Result<bool, UserDbError>
    {
        match &self.user_db {
            None => Ok(false),
            Some(db) => db.is_registered(name),
        }
    }
}
