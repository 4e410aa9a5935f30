use crate::annotations;
use crate::cutthrough::Activation;
use crate::message::RaPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use weft::logging::{self, Logger};
use weft::pool::{SafeRef, SeqPool};

/// What sits on the far side of a connection. Decides the annotations
/// policy on ingress and the strip mode on egress.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionRole {
    Client,
    InterRouter,
    EdgeRouter,
}

/// One raw connection as the pipeline sees it: its role, the negotiated
/// annotations version and the wake latch the event loop polls.
pub struct Connection {
    id: u64,
    role: ConnectionRole,
    annotations_version: i32,
    wake_pending: AtomicBool,
    log: Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(id: u64, role: ConnectionRole, log: L) -> Connection {
        Connection {
            id,
            role,
            annotations_version: annotations::VERSION,
            wake_pending: AtomicBool::new(false),
            log: logging::component(log.into(), "connection"),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Adopt the peer's advertised `qd.annotations-version`; the minimum
    /// governs the session.
    pub fn negotiate_annotations_version(&mut self, peer: i32) {
        self.annotations_version = annotations::negotiate_version(peer);
    }

    #[inline]
    pub fn annotations_version(&self) -> i32 {
        self.annotations_version
    }

    /// Whether messages arriving on this connection must, or must not,
    /// carry the router-annotations section.
    pub fn ra_policy(&self) -> RaPolicy {
        match self.role {
            ConnectionRole::InterRouter | ConnectionRole::EdgeRouter => RaPolicy::Required,
            ConnectionRole::Client => RaPolicy::Forbidden,
        }
    }

    /// Strip mode for messages leaving through this connection.
    pub fn egress_strip(&self) -> annotations::RaStrip {
        match self.role {
            ConnectionRole::InterRouter | ConnectionRole::EdgeRouter => annotations::RaStrip::None,
            ConnectionRole::Client => annotations::RaStrip::All,
        }
    }

    /// Latch the wake request. Returns true when this call raised it.
    pub fn wake(&self) -> bool {
        let raised = !self.wake_pending.swap(true, Ordering::AcqRel);

        if raised {
            logging::trace!(self.log, "connection woken"; "context" => "wake", "id" => self.id);
        }

        raised
    }

    /// Clear and report the wake latch. Called by the owning I/O worker.
    pub fn take_wake(&self) -> bool {
        self.wake_pending.swap(false, Ordering::AcqRel)
    }
}

/// Owner of every live connection. The registry mutex doubles as the
/// server's activation lock: every use of a connection wake primitive goes
/// through it, so a connection can never be woken and freed concurrently.
pub struct Server {
    connections: Mutex<SeqPool<Connection>>,
    log: Logger,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Server {
        Server {
            connections: Mutex::new(SeqPool::new()),
            log: logging::component(log.into(), "server"),
        }
    }

    /// Register a connection, handing back the weak handle used by
    /// activation records.
    pub fn register(&self, connection: Connection) -> SafeRef<Connection> {
        let mut pool = self.connections.lock().expect("Server activation lock poisoned");

        logging::debug!(self.log, "connection registered";
                        "context" => "register",
                        "id" => connection.id());

        pool.push(connection)
    }

    /// Remove a connection. Outstanding handles observe it as gone.
    pub fn unregister(&self, handle: SafeRef<Connection>) -> Option<Connection> {
        let mut pool = self.connections.lock().expect("Server activation lock poisoned");

        let connection = pool.reclaim(handle);

        if let Some(connection) = &connection {
            logging::debug!(self.log, "connection unregistered";
                            "context" => "unregister",
                            "id" => connection.id());
        }

        connection
    }

    /// Wake the connection behind the handle, under the activation lock.
    /// Returns false when the connection has been freed.
    pub fn wake(&self, handle: SafeRef<Connection>) -> bool {
        let pool = self.connections.lock().expect("Server activation lock poisoned");

        match pool.get(handle) {
            Some(connection) => {
                connection.wake();
                true
            }
            None => false,
        }
    }

    /// Wake the counterpart named by an activation record.
    pub fn activate(&self, activation: &Activation) -> bool {
        match activation.connection {
            Some(handle) => self.wake(handle),
            None => false,
        }
    }

    /// Run `f` against the connection behind the handle, under the
    /// activation lock.
    pub fn with_connection<R>(&self, handle: SafeRef<Connection>, f: impl FnOnce(&Connection) -> R) -> Option<R> {
        let pool = self.connections.lock().expect("Server activation lock poisoned");
        pool.get(handle).map(f)
    }

    /// Ids of connections with a pending wake, clearing the latches.
    pub fn drain_woken(&self) -> Vec<SafeRef<Connection>> {
        let pool = self.connections.lock().expect("Server activation lock poisoned");

        pool.handles()
            .filter(|(_, connection)| connection.take_wake())
            .map(|(handle, _)| handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutthrough::ActivationType;

    #[test]
    fn test_role_policies() {
        let router = Connection::new(1, ConnectionRole::InterRouter, None);
        let client = Connection::new(2, ConnectionRole::Client, None);

        assert_eq!(router.ra_policy(), RaPolicy::Required);
        assert_eq!(router.egress_strip(), annotations::RaStrip::None);
        assert_eq!(client.ra_policy(), RaPolicy::Forbidden);
        assert_eq!(client.egress_strip(), annotations::RaStrip::All);
    }

    #[test]
    fn test_version_negotiation() {
        let mut connection = Connection::new(1, ConnectionRole::InterRouter, None);

        connection.negotiate_annotations_version(1);
        assert_eq!(connection.annotations_version(), 1);
    }

    #[test]
    fn test_wake_latch() {
        let connection = Connection::new(1, ConnectionRole::Client, None);

        assert!(connection.wake());
        // Already latched.
        assert!(!connection.wake());

        assert!(connection.take_wake());
        assert!(!connection.take_wake());
    }

    #[test]
    fn test_server_wake_after_free_is_safe() {
        let server = Server::new(None);

        let handle = server.register(Connection::new(1, ConnectionRole::Client, None));

        assert!(server.wake(handle));
        assert_eq!(server.drain_woken(), vec![handle]);

        server.unregister(handle).expect("Connection must be registered");

        // A stale handle is observed as gone, not woken.
        assert!(!server.wake(handle));

        // Even after the slot is reseated.
        let replacement = server.register(Connection::new(2, ConnectionRole::Client, None));
        assert_eq!(replacement.index(), handle.index());
        assert!(!server.wake(handle));
    }

    #[test]
    fn test_activation_wake() {
        let server = Server::new(None);
        let handle = server.register(Connection::new(9, ConnectionRole::Client, None));

        let activation = Activation {
            kind: ActivationType::Tcp,
            connection: Some(handle),
            delivery: None,
        };

        assert!(server.activate(&activation));
        assert!(!server.activate(&Activation::none()));
    }
}
