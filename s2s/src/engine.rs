//! The channel contract between the route/connection manager and the stream
//! engine (spec §1: XML tokenization/writing, TLS, and the I/O reactor are
//! "consumed, not redesigned" here). Nothing in this module performs I/O;
//! it only names the events the engine reports and the commands the main
//! loop issues back, the same way [`crate::registry::StreamHandle`] names
//! the per-connection write contract.

use std::net::IpAddr;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_xmpp::Stanza;

use crate::dialback::DbType;
use crate::domain::{DestKey, RouteKey};
use crate::dns::Candidate;
use crate::registry::{ConnId, StreamHandle};

/// Something the engine reports happened on a connection (or on startup of
/// a new one). Carried over an `mpsc` channel so the main loop can select
/// on it alongside timers, signals, and the router link.
#[derive(Debug)]
pub enum EngineEvent {
    /// A new socket came up, outbound (`dest` set) or inbound (`dest`
    /// `None`, from the local listener). The main loop registers it in the
    /// [`crate::registry::Registry`] and now owns its lifetime.
    Connected {
        dest: Option<DestKey>,
        peer_addr: (IpAddr, u16),
        stream: StreamHandle,
        now: Instant,
    },
    /// Stream negotiation finished; `stream_id` is the value the peer
    /// assigned (outbound) or we assigned (inbound) in the stream header,
    /// used to correlate `<db:verify>` replies.
    StreamOpened { id: ConnId, stream_id: String },
    /// A `<db:result>` arrived on `id` for `route`.
    DbResult { id: ConnId, route: RouteKey, result: Option<DbType>, key: Option<String> },
    /// A `<db:verify>` request arrived on `id` for `route`, asking us to
    /// confirm `key` against the stream id we issued it under.
    DbVerifyRequest { id: ConnId, route: RouteKey, verify_id: String, key: String },
    /// A `<db:verify>` reply arrived on `id` confirming or denying `route`.
    DbVerifyReply { id: ConnId, route: RouteKey, result: DbType },
    /// An ordinary stanza arrived on an already-`valid` route.
    Stanza { id: ConnId, stanza: Stanza },
    /// The connection's socket closed, locally or remotely initiated.
    Closed { id: ConnId },
    /// A connect attempt to one candidate failed; the engine will try the
    /// next, if any, on its own.
    ConnectFailed { dest: DestKey, addr: IpAddr, port: u16, now: Instant },
    /// Every candidate for `dest` was exhausted without success.
    ConnectExhausted { dest: DestKey },
}

/// Something the main loop asks the engine to do.
#[derive(Debug)]
pub enum EngineCommand {
    /// Open a socket to `dest`, trying `candidates` in order.
    Connect { dest: DestKey, candidates: Vec<Candidate> },
    /// Send a `<db:result>` asserting `route` on `id`, with the given key.
    SendDbResult { id: ConnId, route: RouteKey, key: String },
    /// Send a `<db:result>` granting or denying `route` on `id`.
    SendDbResultReply { id: ConnId, route: RouteKey, result: DbType },
    /// Forward a `<db:verify>` for `route` to the originating domain's
    /// connection, identified by `target_stream_id`.
    SendDbVerify { target_stream_id: String, route: RouteKey, id: String, key: String },
    /// Reply to a `<db:verify>` request.
    SendDbVerifyReply { id: ConnId, route: RouteKey, verify_id: String, result: DbType },
    /// Close `id`'s stream with a `<stream:error>` of the given condition
    /// (e.g. `policy-violation` for an oversized stanza) and tear down the
    /// socket.
    CloseWithError { id: ConnId, condition: &'static str },
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(commands: mpsc::UnboundedSender<EngineCommand>) -> Self {
        EngineHandle { commands }
    }

    pub fn connect(&self, dest: DestKey, candidates: Vec<Candidate>) {
        let _ = self.commands.send(EngineCommand::Connect { dest, candidates });
    }

    pub fn send_db_result(&self, id: ConnId, route: RouteKey, key: String) {
        let _ = self.commands.send(EngineCommand::SendDbResult { id, route, key });
    }

    pub fn send_db_result_reply(&self, id: ConnId, route: RouteKey, result: DbType) {
        let _ = self.commands.send(EngineCommand::SendDbResultReply { id, route, result });
    }

    pub fn send_db_verify(&self, target_stream_id: String, route: RouteKey, id: String, key: String) {
        let _ = self.commands.send(EngineCommand::SendDbVerify { target_stream_id, route, id, key });
    }

    pub fn send_db_verify_reply(&self, id: ConnId, route: RouteKey, verify_id: String, result: DbType) {
        let _ = self.commands.send(EngineCommand::SendDbVerifyReply { id, route, verify_id, result });
    }

    pub fn close_with_error(&self, id: ConnId, condition: &'static str) {
        let _ = self.commands.send(EngineCommand::CloseWithError { id, condition });
    }
}
