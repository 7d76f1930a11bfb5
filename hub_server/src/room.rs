use std::collections::HashMap;
use std::sync::Arc;

use dc_proto::Sid;
use parking_lot::RwLock;
use tracing::debug;

use crate::peer::{Message, Peer};

/// A chat channel. The room with the empty name is the main hub chat;
/// named rooms exist but only the main room is wired into the hub core.
pub struct Room
{
    name: String,
    peers: RwLock<HashMap<Sid, Arc<dyn Peer>>>,
}

impl Room
{
    pub fn new(name: impl Into<String>) -> Self
    {
        Self {
            name: name.into(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str
    {
        &self.name
    }

    pub fn len(&self) -> usize
    {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.peers.read().is_empty()
    }

    pub(crate) fn insert(&self, peer: Arc<dyn Peer>)
    {
        self.peers.write().insert(peer.sid(), peer);
    }

    pub(crate) fn remove(&self, sid: Sid)
    {
        self.peers.write().remove(&sid);
    }

    pub fn members(&self) -> Vec<Arc<dyn Peer>>
    {
        self.peers.read().values().cloned().collect()
    }

    /// Fans a chat message out to every subscriber except the sender.
    ///
    /// Iterates over a snapshot of the membership, so no room or directory
    /// lock is held while adapters enqueue frames.
    pub fn send_chat(&self, from: &Arc<dyn Peer>, text: &str)
    {
        let msg = Message {
            name: from.name().to_string(),
            text: text.to_string(),
        };
        for member in self.members() {
            if member.sid() == from.sid() {
                continue;
            }
            if let Err(e) = member.chat_msg(self, from, &msg) {
                debug!("chat to {} failed: {}", member.name(), e);
            }
        }
    }
}
