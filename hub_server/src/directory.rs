use std::collections::HashMap;
use std::sync::Arc;

use dc_proto::Sid;
use parking_lot::RwLock;
use tracing::trace;

use crate::errors::RegistryError;
use crate::name::Nickname;
use crate::peer::{Peer, Protocol};
use crate::room::Room;

/// Twin-index registry of reserved names and live peers.
///
/// One lock covers the reservation set, both live indices and the cached
/// snapshot, so a name is never observably both reserved and live, and
/// promotion or removal is atomic with respect to any reader.
pub struct PeerDirectory
{
    inner: RwLock<DirectoryState>,
}

struct DirectoryState
{
    reserved: HashMap<Nickname, Protocol>,
    by_name: HashMap<Nickname, Arc<dyn Peer>>,
    by_sid: HashMap<Sid, Arc<dyn Peer>>,
    snapshot: Option<Arc<[Arc<dyn Peer>]>>,
}

/// Holds a nickname between validation and promotion.
///
/// Dropping the guard before [`PeerDirectory::promote`] releases the name
/// again, which makes release-on-every-handshake-exit-path automatic.
pub struct NameReservation
{
    name: Nickname,
    directory: Arc<PeerDirectory>,
    released: bool,
}

impl NameReservation
{
    pub fn name(&self) -> &Nickname
    {
        &self.name
    }
}

impl Drop for NameReservation
{
    fn drop(&mut self)
    {
        if !self.released {
            self.directory.release(&self.name);
        }
    }
}

impl PeerDirectory
{
    pub fn new() -> Self
    {
        Self {
            inner: RwLock::new(DirectoryState {
                reserved: HashMap::new(),
                by_name: HashMap::new(),
                by_sid: HashMap::new(),
                snapshot: None,
            }),
        }
    }

    /// True iff no live and no reserved entry holds `name`, except possibly
    /// the peer with the excluded SID (used for renames).
    pub fn available(&self, name: &Nickname, excluding: Option<Sid>) -> bool
    {
        let state = self.inner.read();
        if state.reserved.contains_key(name) {
            return false;
        }
        match state.by_name.get(name) {
            None => true,
            Some(peer) => excluding == Some(peer.sid()),
        }
    }

    /// Atomically checks availability and installs a reservation for `name`.
    pub fn reserve(self: &Arc<Self>, name: Nickname, proto: Protocol)
        -> Result<NameReservation, RegistryError>
    {
        let mut state = self.inner.write();
        if state.reserved.contains_key(&name) || state.by_name.contains_key(&name) {
            return Err(RegistryError::NickTaken);
        }
        trace!("reserving {} for {}", name, proto);
        state.reserved.insert(name.clone(), proto);
        state.snapshot = None;
        Ok(NameReservation {
            name,
            directory: self.clone(),
            released: false,
        })
    }

    fn release(&self, name: &Nickname)
    {
        trace!("releasing reservation of {}", name);
        self.inner.write().reserved.remove(name);
    }

    /// Replaces the reservation with a live entry in both indices, joins the
    /// peer to `room`, and returns the membership to notify. All under one
    /// write acquisition, so chat membership and directory membership never
    /// disagree.
    pub fn promote(&self, mut reservation: NameReservation, peer: Arc<dyn Peer>, room: &Room)
        -> Arc<[Arc<dyn Peer>]>
    {
        let mut state = self.inner.write();
        state.reserved.remove(&reservation.name);
        reservation.released = true;

        debug_assert!(!state.by_sid.contains_key(&peer.sid()), "SID already live");
        debug_assert!(!state.by_name.contains_key(&reservation.name), "name already live");

        state.by_name.insert(reservation.name.clone(), peer.clone());
        state.by_sid.insert(peer.sid(), peer.clone());
        state.snapshot = None;
        room.insert(peer);
        Self::rebuild_snapshot(&mut state)
    }

    /// Removes a live entry from both indices and `room`. Returns the peer
    /// and the post-removal membership, or `None` if the entry is already
    /// gone (a second leave is a no-op).
    pub fn remove(&self, sid: Sid, name: &Nickname, room: &Room)
        -> Option<(Arc<dyn Peer>, Arc<[Arc<dyn Peer>]>)>
    {
        let mut state = self.inner.write();
        let peer = state.by_sid.remove(&sid)?;
        state.by_name.remove(name);
        state.snapshot = None;
        room.remove(sid);
        let notify = Self::rebuild_snapshot(&mut state);
        Some((peer, notify))
    }

    pub fn by_name(&self, name: &Nickname) -> Option<Arc<dyn Peer>>
    {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn by_sid(&self, sid: Sid) -> Option<Arc<dyn Peer>>
    {
        self.inner.read().by_sid.get(&sid).cloned()
    }

    /// The current ordered list of live peers. Snapshots are immutable and
    /// cached: repeated calls between mutations return the same view.
    pub fn snapshot(&self) -> Arc<[Arc<dyn Peer>]>
    {
        {
            let state = self.inner.read();
            if let Some(snapshot) = &state.snapshot {
                return snapshot.clone();
            }
        }
        let mut state = self.inner.write();
        Self::rebuild_snapshot(&mut state)
    }

    pub fn len(&self) -> usize
    {
        self.inner.read().by_sid.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    fn rebuild_snapshot(state: &mut DirectoryState) -> Arc<[Arc<dyn Peer>]>
    {
        if let Some(snapshot) = &state.snapshot {
            return snapshot.clone();
        }
        let mut list: Vec<Arc<dyn Peer>> = state.by_sid.values().cloned().collect();
        list.sort_by_key(|p| p.sid());
        let snapshot: Arc<[Arc<dyn Peer>]> = list.into();
        state.snapshot = Some(snapshot.clone());
        snapshot
    }
}

impl Default for PeerDirectory
{
    fn default() -> Self
    {
        Self::new()
    }
}
