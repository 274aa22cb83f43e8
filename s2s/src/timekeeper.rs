//! Timekeeper sweep (spec §4.6): six ordered phases run every
//! `check_interval` seconds (DNS expiry runs on its own `check_dnscache`
//! cadence instead, so the main loop schedules it separately).

use std::time::Duration;

use tokio::time::Instant;
use tokio_xmpp::Stanza;

use crate::bounce::BounceReason;
use crate::dialback::RouteState;
use crate::dns::DnsCache;
use crate::domain::DestKey;
use crate::queue::OutboundQueueTable;
use crate::registry::{Direction, Registry};

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub check_queue: Duration,
    pub check_keepalive: Duration,
    pub check_idle: Duration,
}

/// What the sweep decided to do, surfaced so the main loop can log it and
/// so tests can assert on behaviour without poking at private state.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub queues_bounced: u32,
    pub dns_entries_zapped: u32,
    pub connections_closed: u32,
    pub keepalives_sent: u32,
}

/// Phase 1: queue expiry. `reuse` controls how a route's `DestKey` (and
/// thus its DNS name and outbound connection) is computed.
pub fn sweep_queue_expiry(
    now: Instant,
    queues: &mut OutboundQueueTable,
    dns: &mut DnsCache,
    registry: &mut Registry,
    reuse: bool,
    check_queue: Duration,
    report: &mut SweepReport,
    mut submit: impl FnMut(Stanza),
) {
    let routes: Vec<_> = queues.route_keys().cloned().collect();
    for route in routes {
        if queues.is_empty_for(&route) {
            continue;
        }
        let dest = DestKey::for_route(&route, reuse);
        let host = dest.to_domain().clone();

        if dns.is_pending(&host) {
            if dns.zap_if_timed_out(&host, now, check_queue) {
                report.dns_entries_zapped += 1;
                queues.bounce_route(&route, BounceReason::RemoteServerNotFound, &mut submit);
                report.queues_bounced += 1;
            }
            continue;
        }

        match registry.find_out(&dest) {
            None => {
                queues.bounce_route(&route, BounceReason::RemoteServerTimeout, &mut submit);
                report.queues_bounced += 1;
            }
            Some(id) => {
                if let Some(conn) = registry.get(id) {
                    if !conn.online && now.saturating_duration_since(conn.init_time) >= check_queue {
                        if let Some((addr, port)) = conn.peer_addr {
                            dns.mark_bad(addr, port, now);
                        }
                        registry.close(id);
                        report.connections_closed += 1;
                    }
                }
            }
        }
    }
}

/// Phase 2: dialback expiry, per connection (both directions).
pub fn sweep_dialback_expiry(now: Instant, registry: &mut Registry, check_queue: Duration, report: &mut SweepReport) {
    let ids: Vec<_> = registry.all_ids().collect();
    for id in ids {
        let Some(conn) = registry.get(id) else { continue };
        let any_timed_out = conn.routes.values().any(|state| state.timed_out(now, check_queue));
        let verify_stalled = conn.direction == Direction::Out
            && conn.verify_count > 0
            && conn
                .last_verify
                .map(|last| now.saturating_duration_since(last) > check_queue)
                .unwrap_or(false);
        if any_timed_out || verify_stalled {
            registry.close(id);
            report.connections_closed += 1;
        }
    }
}

/// Phase 3: incoming liveness.
pub fn sweep_incoming_liveness(now: Instant, registry: &mut Registry, check_queue: Duration, report: &mut SweepReport) {
    let accepting: Vec<_> = registry.in_accept_ids().collect();
    for id in accepting {
        if let Some(conn) = registry.get(id) {
            if now.saturating_duration_since(conn.init_time) >= check_queue {
                registry.close(id);
                report.connections_closed += 1;
            }
        }
    }

    let ids: Vec<_> = registry.all_ids().collect();
    for id in ids {
        if registry.is_closing(id) {
            continue;
        }
        if let Some(conn) = registry.get(id) {
            if conn.direction == Direction::In
                && conn.stream_id.is_some()
                && conn.routes.is_empty()
                && now.saturating_duration_since(conn.init_time) >= check_queue
            {
                registry.close(id);
                report.connections_closed += 1;
            }
        }
    }
}

/// Phase 4: keepalive emission.
pub fn sweep_keepalive(now: Instant, registry: &mut Registry, check_keepalive: Duration, report: &mut SweepReport) {
    if check_keepalive.is_zero() {
        return;
    }
    for id in registry.all_ids().collect::<Vec<_>>() {
        if let Some(conn) = registry.get(id) {
            if conn.online && now.saturating_duration_since(conn.last_activity) > check_keepalive {
                conn.stream.send_keepalive();
                report.keepalives_sent += 1;
            }
        }
    }
}

/// Phase 5: idle eviction.
pub fn sweep_idle_eviction(now: Instant, registry: &mut Registry, check_idle: Duration, report: &mut SweepReport) {
    if check_idle.is_zero() {
        return;
    }
    for id in registry.all_ids().collect::<Vec<_>>() {
        if let Some(conn) = registry.get(id) {
            if conn.online && now.saturating_duration_since(conn.last_packet) > check_idle {
                registry.close(id);
                report.connections_closed += 1;
            }
        }
    }
}

/// Phase 6: DNS cache expiry, on its own `check_dnscache` cadence.
pub fn sweep_dns_expiry(now: Instant, dns: &mut DnsCache) {
    dns.sweep(now);
}

/// Run phases 1-5 in order; phase 6 is scheduled independently by the main
/// loop on `check_dnscache`.
pub fn sweep(
    now: Instant,
    config: &SweepConfig,
    queues: &mut OutboundQueueTable,
    dns: &mut DnsCache,
    registry: &mut Registry,
    reuse: bool,
    mut submit: impl FnMut(Stanza),
) -> SweepReport {
    let mut report = SweepReport::default();
    sweep_queue_expiry(now, queues, dns, registry, reuse, config.check_queue, &mut report, &mut submit);
    sweep_dialback_expiry(now, registry, config.check_queue, &mut report);
    sweep_incoming_liveness(now, registry, config.check_queue, &mut report);
    sweep_keepalive(now, registry, config.check_keepalive, &mut report);
    sweep_idle_eviction(now, registry, config.check_idle, &mut report);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, RouteKey};
    use crate::registry::StreamHandle;
    use jid::Jid;
    use std::str::FromStr;
    use tokio::sync::mpsc;
    use tokio_xmpp::Stanza;
    use xmpp_parsers::message::Message;

    fn noop_handle() -> StreamHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        StreamHandle::new(tx)
    }

    #[tokio::test(start_paused = true)]
    async fn queue_expiry_bounces_when_no_connection_after_check_queue() {
        let mut queues = OutboundQueueTable::new();
        let mut dns = DnsCache::new(
            std::sync::Arc::new(
                hickory_resolver::TokioAsyncResolver::tokio_from_system_conf().unwrap(),
            ),
            crate::dns::DnsConfig::default(),
        )
        .0;
        let mut registry = Registry::new();

        let route = RouteKey::new(Domain::new("a.example").unwrap(), Domain::new("b.example").unwrap());
        let now = Instant::now();
        queues.enqueue(
            route.clone(),
            Stanza::Message(Message::chat(Jid::from_str("v@b.example").unwrap())),
            now,
        );

        // Resolve it so queue_expiry doesn't treat it as DNS-pending.
        dns.complete(
            crate::dns::DnsEvent::Resolved {
                name: Domain::new("b.example").unwrap(),
                candidates: vec![crate::dns::Candidate {
                    addr: "1.2.3.4".parse().unwrap(),
                    port: 5269,
                    priority: 0,
                    weight: 0,
                }],
                ttl: Duration::from_secs(300),
            },
            now,
        );

        let mut report = SweepReport::default();
        let mut bounced = Vec::new();
        sweep_queue_expiry(now, &mut queues, &mut dns, &mut registry, true, Duration::from_secs(60), &mut report, |s| {
            bounced.push(s)
        });
        assert_eq!(report.queues_bounced, 1);
        assert_eq!(bounced.len(), 1);
        assert!(queues.is_empty_for(&route));
    }

    #[tokio::test(start_paused = true)]
    async fn dialback_expiry_closes_stalled_route() {
        let mut registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register_out(
            DestKey::Host(Domain::new("b.example").unwrap()),
            ("1.2.3.4".parse().unwrap(), 5269),
            StreamHandle::new(tx),
            Instant::now(),
        );
        let route = RouteKey::new(Domain::new("a.example").unwrap(), Domain::new("b.example").unwrap());
        let start = Instant::now();
        registry.get_mut(id).unwrap().routes.insert(route, RouteState::begin_in_progress(start));

        tokio::time::advance(Duration::from_secs(61)).await;
        let mut report = SweepReport::default();
        sweep_dialback_expiry(Instant::now(), &mut registry, Duration::from_secs(60), &mut report);
        assert_eq!(report.connections_closed, 1);
        assert!(registry.is_closing(id));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_skipped_when_disabled() {
        let mut registry = Registry::new();
        let id = registry.register_out(
            DestKey::Host(Domain::new("b.example").unwrap()),
            ("1.2.3.4".parse().unwrap(), 5269),
            noop_handle(),
            Instant::now(),
        );
        registry.get_mut(id).unwrap().online = true;
        tokio::time::advance(Duration::from_secs(120)).await;
        let mut report = SweepReport::default();
        sweep_keepalive(Instant::now(), &mut registry, Duration::ZERO, &mut report);
        assert_eq!(report.keepalives_sent, 0);
    }
}
