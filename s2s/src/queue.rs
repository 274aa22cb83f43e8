//! Outbound Queue Table (spec §4.1): per-route FIFO of stanzas waiting for a
//! usable stream to their destination.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use tokio_xmpp::Stanza;

use crate::bounce::{into_error_reply, BounceReason};
use crate::domain::{DestKey, RouteKey};

struct Entry {
    stanza: Stanza,
    queued_at: Instant,
}

#[derive(Default)]
pub struct OutboundQueueTable {
    queues: HashMap<RouteKey, VecDeque<Entry>>,
}

impl OutboundQueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stanza to the end of `route`'s queue, creating it if this is
    /// the first stanza seen for that route.
    pub fn enqueue(&mut self, route: RouteKey, stanza: Stanza, now: Instant) {
        self.queues
            .entry(route)
            .or_default()
            .push_back(Entry { stanza, queued_at: now });
    }

    pub fn is_empty_for(&self, route: &RouteKey) -> bool {
        self.queues.get(route).map_or(true, VecDeque::is_empty)
    }

    /// The age of the oldest pending stanza on `route`, used by the
    /// timekeeper to decide whether a still-resolving or still-connecting
    /// destination has overstayed `check_queue`.
    pub fn oldest_queued_at(&self, route: &RouteKey) -> Option<Instant> {
        self.queues.get(route).and_then(|q| q.front()).map(|e| e.queued_at)
    }

    pub fn has_any_route_to(&self, dest: &DestKey, reuse: bool) -> bool {
        self.queues
            .keys()
            .any(|route| !self.is_empty_for(route) && DestKey::for_route(route, reuse) == *dest)
    }

    /// Drain every route mapping onto `dest` through `deliver`. `deliver`
    /// takes ownership of the stanza and returns it back (`Err`) if the
    /// stream refused it (backpressure), in which case draining for that
    /// route stops with the stanza pushed back to the front of its queue.
    pub fn drain_for_connection<F>(&mut self, reuse: bool, dest: &DestKey, mut deliver: F)
    where
        F: FnMut(&RouteKey, Stanza) -> Result<(), Stanza>,
    {
        for (route, pending) in self.queues.iter_mut() {
            if DestKey::for_route(route, reuse) != *dest {
                continue;
            }
            while let Some(Entry { stanza, queued_at }) = pending.pop_front() {
                if let Err(stanza) = deliver(route, stanza) {
                    pending.push_front(Entry { stanza, queued_at });
                    break;
                }
            }
        }
    }

    /// Bounce every stanza queued for exactly `route`, handing each rewrite
    /// to `submit` (normally the router link's outbound sink). The queue is
    /// emptied regardless of whether a given stanza produced a reply (one is
    /// dropped, not resubmitted, if it was already a stanza-error).
    pub fn bounce_route<F>(&mut self, route: &RouteKey, reason: BounceReason, mut submit: F)
    where
        F: FnMut(Stanza),
    {
        if let Some(pending) = self.queues.remove(route) {
            for Entry { stanza, .. } in pending {
                if let Some(reply) = into_error_reply(stanza, reason) {
                    submit(reply);
                }
            }
        }
    }

    /// Bounce every route whose destination key is `dest`.
    pub fn bounce_destination<F>(&mut self, dest: &DestKey, reuse: bool, reason: BounceReason, mut submit: F)
    where
        F: FnMut(Stanza),
    {
        let matching: Vec<RouteKey> = self
            .queues
            .keys()
            .filter(|route| DestKey::for_route(route, reuse) == *dest)
            .cloned()
            .collect();
        for route in matching {
            self.bounce_route(&route, reason, &mut submit);
        }
    }

    /// Drop the queue for `route` without bouncing, for clean shutdown.
    pub fn discard(&mut self, route: &RouteKey) {
        self.queues.remove(route);
    }

    pub fn route_keys(&self) -> impl Iterator<Item = &RouteKey> {
        self.queues.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use jid::Jid;
    use std::str::FromStr;
    use xmpp_parsers::message::Message;

    fn route(from: &str, to: &str) -> RouteKey {
        RouteKey::new(Domain::new(from).unwrap(), Domain::new(to).unwrap())
    }

    fn msg(to: &str) -> Stanza {
        Stanza::Message(Message::chat(Jid::from_str(to).unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_order_preserved_across_drain() {
        let mut table = OutboundQueueTable::new();
        let r = route("a.example", "b.example");
        table.enqueue(r.clone(), msg("v1@b.example"), Instant::now());
        table.enqueue(r.clone(), msg("v2@b.example"), Instant::now());

        let dest = DestKey::for_route(&r, true);
        let mut delivered = Vec::new();
        table.drain_for_connection(true, &dest, |_, stanza| {
            if let Stanza::Message(m) = &stanza {
                delivered.push(m.to.clone().unwrap().to_string());
            }
            Ok(())
        });
        assert_eq!(delivered, vec!["v1@b.example", "v2@b.example"]);
        assert!(table.is_empty_for(&r));
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_stops_drain_and_requeues_front() {
        let mut table = OutboundQueueTable::new();
        let r = route("a.example", "b.example");
        table.enqueue(r.clone(), msg("v1@b.example"), Instant::now());
        table.enqueue(r.clone(), msg("v2@b.example"), Instant::now());

        let dest = DestKey::for_route(&r, true);
        let mut calls = 0;
        table.drain_for_connection(true, &dest, |_, stanza| {
            calls += 1;
            Err(stanza)
        });
        assert_eq!(calls, 1);
        assert!(!table.is_empty_for(&r));
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_route_rewrites_and_empties_queue() {
        let mut table = OutboundQueueTable::new();
        let r = route("a.example", "b.example");
        table.enqueue(r.clone(), msg("v@b.example"), Instant::now());

        let mut bounced = Vec::new();
        table.bounce_route(&r, BounceReason::RemoteServerNotFound, |s| bounced.push(s));
        assert_eq!(bounced.len(), 1);
        assert!(table.is_empty_for(&r));
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_destination_covers_every_route_to_it() {
        let mut table = OutboundQueueTable::new();
        let r1 = route("a.example", "p.example");
        let r2 = route("a2.example", "p.example");
        table.enqueue(r1.clone(), msg("x@p.example"), Instant::now());
        table.enqueue(r2.clone(), msg("y@p.example"), Instant::now());

        let dest = DestKey::for_route(&r1, true);
        let mut bounced = Vec::new();
        table.bounce_destination(&dest, true, BounceReason::RemoteServerTimeout, |s| bounced.push(s));
        assert_eq!(bounced.len(), 2);
        assert!(table.is_empty_for(&r1));
        assert!(table.is_empty_for(&r2));
    }
}
