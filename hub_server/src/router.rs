//! Dispatch of targeted operations: private chat, client-to-client connect
//! requests and search, independent of the protocol either side speaks.

use std::sync::Arc;

use tracing::debug;

use crate::hub::Hub;
use crate::name::Nickname;
use crate::peer::{Message, Peer, SearchRequest};

impl Hub
{
    /// Relays a private message. An unknown target is dropped silently, not
    /// bounced back to the sender.
    pub(crate) fn private_chat(&self, from: &Arc<dyn Peer>, to: &Nickname, text: &str)
    {
        let Some(target) = self.peer_by_name(to) else {
            debug!("private message from {} to unknown {}", from.name(), to);
            return;
        };
        let msg = Message {
            name: from.name().to_string(),
            text: text.to_string(),
        };
        if let Err(e) = target.private_msg(from, &msg) {
            debug!("private message to {} failed: {}", to, e);
        }
    }

    /// Forwards a connect-to-me request, provided both ends can take part in
    /// client-to-client connections.
    pub(crate) fn route_connect(&self, from: &Arc<dyn Peer>, target: &Arc<dyn Peer>, addr: &str,
                                token: &str, secure: bool)
    {
        if !from.can_connect() || !target.can_connect() {
            debug!("dropping connect request {} -> {}", from.name(), target.name());
            return;
        }
        if let Err(e) = target.connect_to(from, addr, token, secure) {
            debug!("connect request to {} failed: {}", target.name(), e);
        }
    }

    /// Forwards a reverse-connect request for a passive requester.
    pub(crate) fn route_rev_connect(&self, from: &Arc<dyn Peer>, target: &Arc<dyn Peer>,
                                    token: &str, secure: bool)
    {
        if !from.can_connect() || !target.can_connect() {
            debug!("dropping reverse-connect request {} -> {}", from.name(), target.name());
            return;
        }
        if let Err(e) = target.rev_connect_to(from, token, secure) {
            debug!("reverse-connect request to {} failed: {}", target.name(), e);
        }
    }

    /// Fans a search request out to every peer that can receive one.
    pub(crate) fn route_search(&self, from: &Arc<dyn Peer>, req: &SearchRequest)
    {
        for peer in self.peers().iter() {
            if peer.sid() == from.sid() || !peer.can_search() {
                continue;
            }
            if let Err(e) = peer.search(req, from) {
                debug!("search fan-out to {} failed: {}", peer.name(), e);
            }
        }
    }
}
