//! Transport collaborator surface.
//!
//! The replication core never opens sockets itself. It talks to a
//! [`Transport`] that delivers whole messages (not bytes) per connection,
//! reliably per message but with no ordering guarantee across messages.

use crate::error::NetError;
use std::fmt;
use tilesync_core::PeerId;

/// Opaque transport-level connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Result of handing one message to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted for delivery.
    Ok,
    /// Transport is saturated; retry later.
    RateLimited,
    /// Permanent failure for this message.
    Failed(String),
}

/// Connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An outbound [`Transport::connect`] completed.
    Connected {
        /// Handle returned by `connect`.
        handle: ConnectionHandle,
        /// Remote identity.
        peer: PeerId,
    },
    /// A connection closed or was lost.
    Disconnected {
        /// Handle of the lost connection.
        handle: ConnectionHandle,
    },
}

/// Message-oriented transport used by the network subsystem.
///
/// All methods are called from the tick thread and must not block, except
/// [`Transport::flush`], which may wait briefly for queued data to leave.
pub trait Transport {
    /// Open a connection to `peer`. Completion is reported as
    /// [`TransportEvent::Connected`].
    fn connect(&mut self, peer: PeerId) -> Result<ConnectionHandle, NetError>;

    /// Next incoming connection, if any.
    fn accept(&mut self) -> Option<(ConnectionHandle, PeerId)>;

    /// Send one framed message.
    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> SendOutcome;

    /// Push buffered data for `handle` onto the wire.
    fn flush(&mut self, _handle: ConnectionHandle) {}

    /// Up to `max` received messages.
    fn poll_receive(&mut self, max: usize) -> Vec<(ConnectionHandle, Vec<u8>)>;

    /// Lifecycle events since the last poll.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Close a connection. The remote side observes a disconnect.
    fn close(&mut self, handle: ConnectionHandle);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, peer: PeerId) -> Result<ConnectionHandle, NetError> {
        (**self).connect(peer)
    }

    fn accept(&mut self) -> Option<(ConnectionHandle, PeerId)> {
        (**self).accept()
    }

    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> SendOutcome {
        (**self).send(handle, frame)
    }

    fn flush(&mut self, handle: ConnectionHandle) {
        (**self).flush(handle)
    }

    fn poll_receive(&mut self, max: usize) -> Vec<(ConnectionHandle, Vec<u8>)> {
        (**self).poll_receive(max)
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        (**self).poll_events()
    }

    fn close(&mut self, handle: ConnectionHandle) {
        (**self).close(handle)
    }
}
