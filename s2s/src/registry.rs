//! Connection record and Connection Registry (spec §3 "Connection record",
//! §4.3).
//!
//! Each connection (outbound socket to a peer, or inbound socket accepted
//! from one) is a `Connection` owned by a `Registry` slab. Callers never
//! hold a `&Connection` across an `.await` point or a channel send; they
//! look it up again by `ConnId` each time, matching the single-threaded,
//! message-passing model the rest of this crate follows. `ConnId` carries a
//! generation counter so a stale handle from before a `close()` is detected
//! rather than silently aliasing a reused slot.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_xmpp::Stanza;

use crate::dialback::RouteState;
use crate::domain::{DestKey, RouteKey};

/// A generational handle into the registry's slab. Stable across moves of
/// the `Connection` it names; invalid after `Registry::close` frees the
/// slot, even if the index is later reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// One instruction for the task driving a connection's negotiated stream.
/// A plain whitespace byte is XMPP's traditional keepalive: it's not
/// well-formed XML and so never shows up as a stanza, but keeps NATs and
/// idle-timeout middleboxes from reaping the TCP connection.
pub enum WriteCommand {
    Stanza(Stanza),
    Keepalive,
    Close,
}

/// A handle to the task driving the negotiated XMPP stream for a
/// connection. Framing, TLS, and stream negotiation live in that task (see
/// `tokio_xmpp::xmlstream`/`tokio_xmpp::connect`); the registry only needs
/// to feed it write commands.
pub struct StreamHandle {
    outbound: mpsc::UnboundedSender<WriteCommand>,
}

impl StreamHandle {
    pub fn new(outbound: mpsc::UnboundedSender<WriteCommand>) -> Self {
        StreamHandle { outbound }
    }

    /// Hand a stanza to the stream's write task. `Err` gives the stanza
    /// back, meaning the stream is already gone (the task's receiver was
    /// dropped); the caller should treat this exactly like backpressure
    /// refusal in [`crate::queue::OutboundQueueTable::drain_for_connection`].
    pub fn send(&self, stanza: Stanza) -> Result<(), Stanza> {
        self.outbound.send(WriteCommand::Stanza(stanza)).map_err(|e| match e.0 {
            WriteCommand::Stanza(stanza) => stanza,
            _ => unreachable!(),
        })
    }

    /// Best-effort: dropped silently if the write task is already gone.
    pub fn send_keepalive(&self) {
        let _ = self.outbound.send(WriteCommand::Keepalive);
    }

    /// Ask the write task to flush and shut the stream down. Best-effort:
    /// if the task is already gone there's nothing left to tell it.
    pub fn request_close(&self) {
        let _ = self.outbound.send(WriteCommand::Close);
    }
}

/// {socket, peer ip/port, direction, online flag, init_time, last_activity,
/// last_packet, last_verify, verify-count, primary route key and
/// destination key (out only), set of route keys carried, per-route state
/// map, stream handle} — spec §3.
pub struct Connection {
    pub direction: Direction,
    pub peer_addr: Option<(IpAddr, u16)>,
    pub online: bool,
    pub init_time: Instant,
    pub last_activity: Instant,
    pub last_packet: Instant,
    pub last_verify: Option<Instant>,
    pub verify_count: u32,
    /// Set only for outbound connections: the route that caused this
    /// connection to be opened and the destination key it was registered
    /// under.
    pub primary_route: Option<RouteKey>,
    pub dest: Option<DestKey>,
    /// The stream id this connection's stream opened with, once known.
    /// Used to correlate `<db:verify>` replies to an inbound connection.
    pub stream_id: Option<String>,
    pub routes: HashMap<RouteKey, RouteState>,
    pub stream: StreamHandle,
}

impl Connection {
    fn new(direction: Direction, peer_addr: Option<(IpAddr, u16)>, stream: StreamHandle, now: Instant) -> Self {
        Connection {
            direction,
            peer_addr,
            online: false,
            init_time: now,
            last_activity: now,
            last_packet: now,
            last_verify: None,
            verify_count: 0,
            primary_route: None,
            dest: None,
            stream_id: None,
            routes: HashMap::new(),
            stream,
        }
    }
}

enum Slot {
    Occupied { generation: u64, conn: Connection },
    Vacant { generation: u64 },
}

/// Owns every live connection and the indices used to find them: by
/// outbound destination key, by inbound accept state, and by inbound
/// stream id (for dialback verify correlation).
#[derive(Default)]
pub struct Registry {
    slab: Vec<Slot>,
    free: Vec<usize>,
    out_by_dest: HashMap<DestKey, ConnId>,
    in_accept: HashSet<ConnId>,
    in_by_stream_id: HashMap<String, ConnId>,
    dead: Vec<ConnId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, conn: Connection) -> ConnId {
        if let Some(index) = self.free.pop() {
            let generation = match &self.slab[index] {
                Slot::Vacant { generation } => *generation + 1,
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.slab[index] = Slot::Occupied { generation, conn };
            ConnId { index, generation }
        } else {
            let index = self.slab.len();
            self.slab.push(Slot::Occupied { generation: 0, conn });
            ConnId { index, generation: 0 }
        }
    }

    /// Register a new outbound connection under `dest`, replacing whatever
    /// was previously registered there (the caller is responsible for
    /// having closed it first if it was still live).
    pub fn register_out(
        &mut self,
        dest: DestKey,
        peer_addr: (IpAddr, u16),
        stream: StreamHandle,
        now: Instant,
    ) -> ConnId {
        let mut conn = Connection::new(Direction::Out, Some(peer_addr), stream, now);
        conn.dest = Some(dest.clone());
        let id = self.insert(conn);
        self.out_by_dest.insert(dest, id);
        id
    }

    /// Register a freshly accepted inbound socket; no stream has been
    /// negotiated on it yet.
    pub fn register_in(&mut self, peer_addr: (IpAddr, u16), stream: StreamHandle, now: Instant) -> ConnId {
        let conn = Connection::new(Direction::In, Some(peer_addr), stream, now);
        let id = self.insert(conn);
        self.in_accept.insert(id);
        id
    }

    /// Move an inbound connection out of the "accepted, no stream yet"
    /// index once its stream has opened, recording the peer-visible stream
    /// id so later `<db:verify>` replies can be matched back to it.
    pub fn promote_accept_to_stream(&mut self, id: ConnId, stream_id: String) -> Option<()> {
        self.in_accept.remove(&id);
        let conn = self.get_mut(id)?;
        conn.stream_id = Some(stream_id.clone());
        self.in_by_stream_id.insert(stream_id, id);
        Some(())
    }

    pub fn find_out(&self, dest: &DestKey) -> Option<ConnId> {
        self.out_by_dest.get(dest).copied()
    }

    pub fn find_in_by_stream_id(&self, stream_id: &str) -> Option<ConnId> {
        self.in_by_stream_id.get(stream_id).copied()
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        match self.slab.get(id.index)? {
            Slot::Occupied { generation, conn } if *generation == id.generation => Some(conn),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        match self.slab.get_mut(id.index)? {
            Slot::Occupied { generation, conn } if *generation == id.generation => Some(conn),
            _ => None,
        }
    }

    pub fn in_accept_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.in_accept.iter().copied()
    }

    pub fn all_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.slab.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, .. } => Some(ConnId { index, generation: *generation }),
            Slot::Vacant { .. } => None,
        })
    }

    /// Unlink `id` from every index and ask its stream to tear down, then
    /// push it onto the dead queue. The slot itself stays occupied (so a
    /// late lookup by a stale caller within this tick still sees the
    /// connection) until [`Registry::reap_dead`] runs at the top of the
    /// next reactor tick.
    pub fn close(&mut self, id: ConnId) {
        if let Some(conn) = self.get(id) {
            conn.stream.request_close();
            if let Some(dest) = &conn.dest {
                if self.out_by_dest.get(dest) == Some(&id) {
                    self.out_by_dest.remove(dest);
                }
            }
            if let Some(stream_id) = conn.stream_id.clone() {
                self.in_by_stream_id.remove(&stream_id);
            }
        }
        self.in_accept.remove(&id);
        if !self.dead.contains(&id) {
            self.dead.push(id);
        }
    }

    pub fn is_closing(&self, id: ConnId) -> bool {
        self.dead.contains(&id)
    }

    /// Free every slot queued by `close()` since the last call. Must run
    /// before any other phase of a reactor tick touches the registry, so no
    /// phase can observe a half-torn-down connection (spec §5, "no
    /// freed-pointer callback").
    pub fn reap_dead(&mut self) -> Vec<Connection> {
        let mut freed = Vec::with_capacity(self.dead.len());
        for id in self.dead.drain(..) {
            let slot = std::mem::replace(
                &mut self.slab[id.index],
                Slot::Vacant { generation: id.generation },
            );
            if let Slot::Occupied { conn, .. } = slot {
                freed.push(conn);
            }
            self.free.push(id.index);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;

    fn handle() -> (StreamHandle, mpsc::UnboundedReceiver<WriteCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamHandle::new(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn register_and_find_out() {
        let mut registry = Registry::new();
        let dest = DestKey::Host(Domain::new("b.example").unwrap());
        let (stream, _rx) = handle();
        let id = registry.register_out(dest.clone(), ("1.2.3.4".parse().unwrap(), 5269), stream, Instant::now());
        assert_eq!(registry.find_out(&dest), Some(id));
        assert!(registry.get(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn close_unlinks_immediately_but_frees_only_on_reap() {
        let mut registry = Registry::new();
        let dest = DestKey::Host(Domain::new("b.example").unwrap());
        let (stream, _rx) = handle();
        let id = registry.register_out(dest.clone(), ("1.2.3.4".parse().unwrap(), 5269), stream, Instant::now());

        registry.close(id);
        assert_eq!(registry.find_out(&dest), None);
        assert!(registry.get(id).is_some(), "slot still occupied until reap");
        assert!(registry.is_closing(id));

        let freed = registry.reap_dead();
        assert_eq!(freed.len(), 1);
        assert!(registry.get(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_conn_id_after_slot_reuse_is_rejected() {
        let mut registry = Registry::new();
        let dest_a = DestKey::Host(Domain::new("a.example").unwrap());
        let dest_b = DestKey::Host(Domain::new("b.example").unwrap());
        let (stream_a, _rx_a) = handle();
        let id_a = registry.register_out(dest_a, ("1.2.3.4".parse().unwrap(), 5269), stream_a, Instant::now());
        registry.close(id_a);
        registry.reap_dead();

        let (stream_b, _rx_b) = handle();
        let id_b = registry.register_out(dest_b, ("5.6.7.8".parse().unwrap(), 5269), stream_b, Instant::now());
        assert_eq!(id_b.index, id_a.index, "slot reused");
        assert_ne!(id_b.generation, id_a.generation);
        assert!(registry.get(id_a).is_none(), "stale handle must not alias the new connection");
        assert!(registry.get(id_b).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_then_promote_to_stream() {
        let mut registry = Registry::new();
        let (stream, _rx) = handle();
        let id = registry.register_in(("9.9.9.9".parse().unwrap(), 40000), stream, Instant::now());
        assert!(registry.in_accept_ids().any(|i| i == id));

        registry.promote_accept_to_stream(id, "stream-1".to_string());
        assert!(!registry.in_accept_ids().any(|i| i == id));
        assert_eq!(registry.find_in_by_stream_id("stream-1"), Some(id));
    }
}
