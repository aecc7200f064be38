//! In-process transport for tests and the loopback demo.
//!
//! A [`MemoryNetwork`] is a shared hub; each participant gets a
//! [`MemoryTransport`] endpoint from it. The hub can inject the faults the
//! replication core has to survive: send budgets that produce
//! [`SendOutcome::RateLimited`], hard send failures, delivery reordering and
//! abrupt peer loss.

use crate::error::NetError;
use crate::transport::{ConnectionHandle, SendOutcome, Transport, TransportEvent};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tilesync_core::PeerId;
use tracing::{debug, trace};

/// One message handed to the hub, recorded for assertions and traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sending endpoint.
    pub from: PeerId,
    /// Receiving endpoint.
    pub to: PeerId,
    /// First frame byte (message kind tag).
    pub kind: u8,
    /// Frame length.
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    remote: PeerId,
    remote_handle: ConnectionHandle,
}

#[derive(Debug, Default)]
struct Endpoint {
    online: bool,
    links: HashMap<ConnectionHandle, Link>,
    incoming: VecDeque<(ConnectionHandle, PeerId)>,
    inbox: VecDeque<(ConnectionHandle, Vec<u8>)>,
    events: Vec<TransportEvent>,
    send_budget: Option<usize>,
    failing: bool,
    reorder: bool,
}

#[derive(Debug)]
struct Hub {
    next_handle: u64,
    endpoints: HashMap<PeerId, Endpoint>,
    deliveries: Vec<Delivery>,
    rng: StdRng,
}

impl Hub {
    fn allocate(&mut self) -> ConnectionHandle {
        self.next_handle += 1;
        ConnectionHandle(self.next_handle)
    }

    /// Tear down one side of a link and notify the other side.
    fn sever(&mut self, local: PeerId, handle: ConnectionHandle) {
        let link = match self.endpoints.get_mut(&local).and_then(|ep| ep.links.remove(&handle)) {
            Some(link) => link,
            None => return,
        };
        if let Some(remote) = self.endpoints.get_mut(&link.remote) {
            remote.links.remove(&link.remote_handle);
            remote.incoming.retain(|(h, _)| *h != link.remote_handle);
            remote.inbox.retain(|(h, _)| *h != link.remote_handle);
            remote.events.push(TransportEvent::Disconnected {
                handle: link.remote_handle,
            });
        }
    }
}

/// Shared in-memory hub.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl MemoryNetwork {
    /// Empty network with a fixed reorder seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                next_handle: 0,
                endpoints: HashMap::new(),
                deliveries: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `peer` and return its endpoint.
    pub fn endpoint(&self, peer: PeerId) -> MemoryTransport {
        let mut hub = self.hub();
        let endpoint = hub.endpoints.entry(peer).or_default();
        endpoint.online = true;
        MemoryTransport {
            peer,
            network: self.clone(),
        }
    }

    /// Limit how many further messages `peer` may send before every send
    /// reports `RateLimited`. `None` removes the limit.
    pub fn set_send_budget(&self, peer: PeerId, budget: Option<usize>) {
        if let Some(ep) = self.hub().endpoints.get_mut(&peer) {
            ep.send_budget = budget;
        }
    }

    /// Make every send from `peer` fail permanently (or stop doing so).
    pub fn set_failing(&self, peer: PeerId, failing: bool) {
        if let Some(ep) = self.hub().endpoints.get_mut(&peer) {
            ep.failing = failing;
        }
    }

    /// Shuffle messages queued for `peer` each time it polls.
    pub fn set_reorder(&self, peer: PeerId, reorder: bool) {
        if let Some(ep) = self.hub().endpoints.get_mut(&peer) {
            ep.reorder = reorder;
        }
    }

    /// Drop every connection of `peer` as if its process vanished.
    pub fn disconnect(&self, peer: PeerId) {
        let mut hub = self.hub();
        let handles: Vec<ConnectionHandle> = match hub.endpoints.get_mut(&peer) {
            Some(ep) => {
                ep.online = false;
                ep.links.keys().copied().collect()
            }
            None => return,
        };
        debug!(%peer, links = handles.len(), "Simulating peer loss");
        for handle in handles {
            hub.sever(peer, handle);
            if let Some(ep) = hub.endpoints.get_mut(&peer) {
                ep.events.push(TransportEvent::Disconnected { handle });
            }
        }
    }

    /// Open links held by `peer`.
    pub fn link_count(&self, peer: PeerId) -> usize {
        self.hub()
            .endpoints
            .get(&peer)
            .map(|ep| ep.links.len())
            .unwrap_or(0)
    }

    /// Messages waiting in `peer`'s inbox.
    pub fn pending(&self, peer: PeerId) -> usize {
        self.hub()
            .endpoints
            .get(&peer)
            .map(|ep| ep.inbox.len())
            .unwrap_or(0)
    }

    /// Take the delivery log accumulated since the last call.
    pub fn take_deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.hub().deliveries)
    }
}

/// One participant's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    peer: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Identity this endpoint was registered under.
    pub fn local_peer(&self) -> PeerId {
        self.peer
    }

    /// The hub this endpoint belongs to.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, peer: PeerId) -> Result<ConnectionHandle, NetError> {
        let mut hub = self.network.hub();
        let reachable = hub.endpoints.get(&peer).map(|ep| ep.online).unwrap_or(false);
        if !reachable || peer == self.peer {
            return Err(NetError::Unreachable(peer));
        }

        let local_handle = hub.allocate();
        let remote_handle = hub.allocate();
        if let Some(remote) = hub.endpoints.get_mut(&peer) {
            remote.links.insert(
                remote_handle,
                Link {
                    remote: self.peer,
                    remote_handle: local_handle,
                },
            );
            remote.incoming.push_back((remote_handle, self.peer));
        }
        if let Some(local) = hub.endpoints.get_mut(&self.peer) {
            local.links.insert(
                local_handle,
                Link {
                    remote: peer,
                    remote_handle,
                },
            );
            local.events.push(TransportEvent::Connected {
                handle: local_handle,
                peer,
            });
        }
        debug!(from = %self.peer, to = %peer, %local_handle, "Memory link opened");
        Ok(local_handle)
    }

    fn accept(&mut self) -> Option<(ConnectionHandle, PeerId)> {
        self.network
            .hub()
            .endpoints
            .get_mut(&self.peer)
            .and_then(|ep| ep.incoming.pop_front())
    }

    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> SendOutcome {
        let mut hub = self.network.hub();
        let link = {
            let Some(local) = hub.endpoints.get_mut(&self.peer) else {
                return SendOutcome::Failed("endpoint not registered".into());
            };
            if local.failing {
                return SendOutcome::Failed("injected send failure".into());
            }
            let Some(link) = local.links.get(&handle).copied() else {
                return SendOutcome::Failed(format!("no link {handle}"));
            };
            match local.send_budget.as_mut() {
                Some(0) => return SendOutcome::RateLimited,
                Some(budget) => *budget -= 1,
                None => {}
            }
            link
        };

        match hub.endpoints.get_mut(&link.remote) {
            Some(remote) => remote.inbox.push_back((link.remote_handle, frame.to_vec())),
            None => return SendOutcome::Failed(format!("{} vanished", link.remote)),
        }
        trace!(from = %self.peer, to = %link.remote, bytes = frame.len(), "Memory send");
        hub.deliveries.push(Delivery {
            from: self.peer,
            to: link.remote,
            kind: frame.first().copied().unwrap_or(u8::MAX),
            bytes: frame.len(),
        });
        SendOutcome::Ok
    }

    fn poll_receive(&mut self, max: usize) -> Vec<(ConnectionHandle, Vec<u8>)> {
        let mut guard = self.network.hub();
        let hub = &mut *guard;
        let Some(ep) = hub.endpoints.get_mut(&self.peer) else {
            return Vec::new();
        };
        if ep.reorder && ep.inbox.len() > 1 {
            ep.inbox.make_contiguous().shuffle(&mut hub.rng);
        }
        let take = max.min(ep.inbox.len());
        ep.inbox.drain(..take).collect()
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.network
            .hub()
            .endpoints
            .get_mut(&self.peer)
            .map(|ep| std::mem::take(&mut ep.events))
            .unwrap_or_default()
    }

    fn close(&mut self, handle: ConnectionHandle) {
        self.network.hub().sever(self.peer, handle);
    }
}
