//! Main loop (spec §5): a single `Context` threaded explicitly through one
//! `tokio::select!` dispatch, no global mutable state. Reaps dead
//! connections at the top of every iteration before any phase can observe a
//! half-torn-down connection (spec §9, "deferred free via dead queues").

use std::collections::HashMap;
use std::sync::Arc;

use hickory_resolver::TokioAsyncResolver;
use log::{info, warn};
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

use crate::bounce::BounceReason;
use crate::config::Config;
use crate::dialback::{dialback_key, DbType, RouteState, Secret};
use crate::dns::{DnsCache, DnsEvent};
use crate::domain::{DestKey, Domain, RouteKey};
use crate::engine::{EngineEvent, EngineHandle};
use crate::error::Result;
use crate::hosts::HostTable;
use crate::queue::OutboundQueueTable;
use crate::registry::{ConnId, Direction, Registry};
use crate::router_link::{self, RouterEvent, RouterLinkHandle};
use crate::signals::{SignalEvent, Signals};
use crate::stats::PacketStats;
use crate::timekeeper::{self, SweepConfig};

struct PendingVerify {
    inbound_id: ConnId,
    route: RouteKey,
    key: String,
}

pub struct Context {
    config: Config,
    secret: Secret,
    registry: Registry,
    queues: OutboundQueueTable,
    dns: DnsCache,
    hosts: HostTable,
    pending_verifies: HashMap<DestKey, Vec<PendingVerify>>,
    router: RouterLinkHandle,
    engine: EngineHandle,
    stats: Option<PacketStats>,
}

impl Context {
    fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            check_queue: self.config.check.queue,
            check_keepalive: self.config.check.keepalive,
            check_idle: self.config.check.idle,
        }
    }

    fn reuse(&self) -> bool {
        self.config.out_conn_reuse
    }
}

/// Drive the connector until a shutdown signal arrives or the router link
/// gives up permanently (spec S6).
pub async fn run(
    config: Config,
    resolver: Arc<TokioAsyncResolver>,
    engine_events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    engine: EngineHandle,
) -> Result<()> {
    let secret = config
        .local
        .secret
        .clone()
        .map(Secret::new)
        .unwrap_or_else(Secret::generate);

    let dns_config = crate::dns::DnsConfig {
        srv_prefixes: config.lookup.srv_prefixes.clone(),
        resolve_ipv6: config.lookup.resolve_ipv6,
        min_ttl: config.lookup.min_ttl,
        max_ttl: config.lookup.max_ttl,
        bad_host_timeout: config.lookup.bad_host_timeout,
        no_cache: config.lookup.no_cache,
    };
    let (dns, mut dns_events_rx) = DnsCache::new(resolver, dns_config);

    let hosts = config.hosts.clone();

    let router_config = router_link::RouterConfig {
        id: config.id.clone(),
        ip: config.router.ip.clone(),
        port: config.router.port,
        pass: config.router.pass.clone(),
        retry_init: config.router.retry_init,
        retry_lost: config.router.retry_lost,
        retry_sleep: config.router.retry_sleep,
    };
    let (router, mut router_events_rx) = router_link::spawn(router_config);

    let stats = config.stats_packet.clone().map(PacketStats::new);
    let mut signals = Signals::install()?;

    let mut ctx = Context {
        config,
        secret,
        registry: Registry::new(),
        queues: OutboundQueueTable::new(),
        dns,
        hosts,
        pending_verifies: HashMap::new(),
        router,
        engine,
        stats,
    };

    let mut sweep_ticker = interval(ctx.config.check.interval);
    let mut dnscache_ticker = interval(ctx.config.check.dnscache);
    let mut stats_ticker = interval(crate::stats::WRITE_INTERVAL);
    let mut engine_events_rx = engine_events_rx;

    loop {
        ctx.registry.reap_dead();

        tokio::select! {
            signal = signals.recv() => {
                match signal {
                    SignalEvent::Shutdown => {
                        info!("shutdown signal received, exiting main loop");
                        return Ok(());
                    }
                    SignalEvent::Reload => {
                        info!("SIGHUP received; log rotation/config reload is not yet wired up beyond this notice");
                    }
                }
            }
            event = router_events_rx.recv() => {
                match event {
                    Some(event) => handle_router_event(&mut ctx, event),
                    None => {
                        warn!("router link task gone; shutting down");
                        return Ok(());
                    }
                }
            }
            event = dns_events_rx.recv() => {
                if let Some(event) = event {
                    handle_dns_event(&mut ctx, event);
                }
            }
            event = engine_events_rx.recv() => {
                match event {
                    Some(event) => handle_engine_event(&mut ctx, event),
                    None => {
                        warn!("stream engine gone; shutting down");
                        return Ok(());
                    }
                }
            }
            _ = sweep_ticker.tick() => {
                run_sweep(&mut ctx);
            }
            _ = dnscache_ticker.tick() => {
                timekeeper::sweep_dns_expiry(Instant::now(), &mut ctx.dns);
            }
            _ = stats_ticker.tick() => {
                if let Some(stats) = ctx.stats.as_ref() {
                    stats.write()?;
                }
            }
        }
    }
}

fn run_sweep(ctx: &mut Context) {
    let now = Instant::now();
    let reuse = ctx.reuse();
    let sweep_config = ctx.sweep_config();
    let router = ctx.router.clone();
    let report = timekeeper::sweep(now, &sweep_config, &mut ctx.queues, &mut ctx.dns, &mut ctx.registry, reuse, |reply| {
        let _ = router.send(reply);
    });
    if report.queues_bounced > 0 || report.connections_closed > 0 {
        info!(
            "sweep: {} queues bounced, {} connections closed, {} dns entries zapped, {} keepalives sent",
            report.queues_bounced, report.connections_closed, report.dns_entries_zapped, report.keepalives_sent
        );
    }
}

fn handle_router_event(ctx: &mut Context, event: RouterEvent) {
    match event {
        RouterEvent::Connected => info!("router link connected"),
        RouterEvent::Lost { attempt } => warn!("router link lost, reconnect attempt {}", attempt),
        RouterEvent::GivenUp => warn!("router link exhausted its retry budget"),
        RouterEvent::Stanza(stanza) => handle_outbound_stanza(ctx, stanza),
    }
}

fn stanza_domains(stanza: &tokio_xmpp::Stanza) -> Option<(Domain, Domain)> {
    let (from, to) = match stanza {
        tokio_xmpp::Stanza::Iq(iq) => (iq.from.as_ref(), iq.to.as_ref()),
        tokio_xmpp::Stanza::Message(m) => (m.from.as_ref(), m.to.as_ref()),
        tokio_xmpp::Stanza::Presence(p) => (p.from.as_ref(), p.to.as_ref()),
    };
    let from = Domain::new(from?.domain().as_str()).ok()?;
    let to = Domain::new(to?.domain().as_str()).ok()?;
    Some((from, to))
}

/// A stanza handed to us by the router for delivery to a remote peer.
fn handle_outbound_stanza(ctx: &mut Context, stanza: tokio_xmpp::Stanza) {
    let Some((from, to)) = stanza_domains(&stanza) else {
        warn!("dropping stanza with unparseable from/to");
        return;
    };
    if !ctx.hosts.is_local(&from) {
        warn!("dropping stanza from non-local domain {}", from);
        return;
    }

    let route = RouteKey::new(from, to);
    let dest = DestKey::for_route(&route, ctx.reuse());
    let now = Instant::now();

    let valid_conn = ctx.registry.find_out(&dest).filter(|id| {
        ctx.registry
            .get(*id)
            .and_then(|conn| conn.routes.get(&route))
            .map(RouteState::is_valid)
            .unwrap_or(false)
    });

    if let Some(id) = valid_conn {
        let conn = ctx.registry.get(id).expect("just looked up");
        if let Err(stanza) = conn.stream.send(stanza) {
            ctx.queues.enqueue(route, stanza, now);
        }
        return;
    }

    let online_conn = ctx.registry.find_out(&dest);
    let already_resolving = online_conn.is_some() || ctx.queues.has_any_route_to(&dest, ctx.reuse());
    ctx.queues.enqueue(route, stanza, now);
    if let Some(id) = online_conn {
        // The connection is already up but this route hasn't ridden it yet
        // (fresh route onto a shared/reused stream). Kick off dialback for
        // it now instead of waiting for a StreamOpened event that already
        // happened.
        initiate_routes_for_dest(ctx, id, &dest);
    } else if !already_resolving {
        start_resolution(ctx, &dest, now);
    }
}

fn start_resolution(ctx: &mut Context, dest: &DestKey, now: Instant) {
    match ctx.dns.lookup(dest.to_domain(), now) {
        crate::dns::LookupStatus::Pending => {}
        crate::dns::LookupStatus::Ready(candidates) => {
            ctx.engine.connect(dest.clone(), candidates);
        }
        crate::dns::LookupStatus::Negative => {
            bounce_destination(ctx, dest, BounceReason::RemoteServerNotFound);
        }
    }
}

fn bounce_destination(ctx: &mut Context, dest: &DestKey, reason: BounceReason) {
    let router = ctx.router.clone();
    ctx.queues.bounce_destination(dest, ctx.config.out_conn_reuse, reason, |reply| {
        let _ = router.send(reply);
    });
}

fn handle_dns_event(ctx: &mut Context, event: DnsEvent) {
    let now = Instant::now();
    let name = match &event {
        DnsEvent::Resolved { name, .. } => name.clone(),
        DnsEvent::Negative { name } => name.clone(),
    };
    ctx.dns.complete(event, now);

    let reuse = ctx.reuse();
    let dests: Vec<DestKey> = ctx
        .queues
        .route_keys()
        .filter(|route| route.to == name)
        .map(|route| DestKey::for_route(route, reuse))
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .collect();

    for dest in dests {
        match ctx.dns.lookup(dest.to_domain(), now) {
            crate::dns::LookupStatus::Ready(candidates) => ctx.engine.connect(dest, candidates),
            crate::dns::LookupStatus::Pending => {}
            crate::dns::LookupStatus::Negative => {
                bounce_destination(ctx, &dest, BounceReason::RemoteServerNotFound);
            }
        }
    }
}

fn handle_engine_event(ctx: &mut Context, event: EngineEvent) {
    match event {
        EngineEvent::Connected { dest, peer_addr, stream, now } => {
            let id = match dest {
                Some(dest) => ctx.registry.register_out(dest, peer_addr, stream, now),
                None => ctx.registry.register_in(peer_addr, stream, now),
            };
            let _ = id;
        }
        EngineEvent::StreamOpened { id, stream_id } => {
            let is_inbound = ctx.registry.get(id).map(|c| c.direction == Direction::In).unwrap_or(false);
            if is_inbound {
                ctx.registry.promote_accept_to_stream(id, stream_id);
            } else {
                let dest = ctx.registry.get(id).and_then(|c| c.dest.clone());
                if let Some(conn) = ctx.registry.get_mut(id) {
                    conn.stream_id = Some(stream_id);
                    conn.online = true;
                }
                if let Some(dest) = dest {
                    initiate_routes_for_dest(ctx, id, &dest);
                    flush_pending_verifies(ctx, &dest, id);
                }
            }
        }
        EngineEvent::DbResult { id, route, result, key } => match result {
            Some(result) => handle_db_result_reply(ctx, id, route, result),
            None => {
                if let Some(key) = key {
                    handle_db_result_assertion(ctx, id, route, key);
                }
            }
        },
        EngineEvent::DbVerifyRequest { id, route, verify_id, key } => {
            handle_db_verify_request(ctx, id, route, verify_id, key);
        }
        EngineEvent::DbVerifyReply { id, route, result } => {
            handle_db_verify_reply(ctx, id, route, result);
        }
        EngineEvent::Stanza { id, stanza } => {
            let element: Element = stanza.into();
            if let Some(limit) = ctx.config.io.max_stanza_size {
                if element.to_string().len() > limit {
                    warn!("closing connection {:?}: stanza exceeds io.limits.stanzasize ({} bytes)", id, limit);
                    ctx.engine.close_with_error(id, "policy-violation");
                    return;
                }
            }
            if let Some(stats) = ctx.stats.as_mut() {
                stats.record_packet();
            }
            match tokio_xmpp::Stanza::try_from(element) {
                Ok(stanza) => {
                    let _ = ctx.router.send(stanza);
                }
                Err(_) => warn!("dropping stanza that failed to re-parse after size check"),
            }
        }
        EngineEvent::Closed { id } => {
            ctx.registry.close(id);
        }
        EngineEvent::ConnectFailed { dest, addr, port, now } => {
            ctx.dns.mark_bad(addr, port, now);
            let _ = dest;
        }
        EngineEvent::ConnectExhausted { dest } => {
            bounce_destination(ctx, &dest, BounceReason::RemoteServerTimeout);
        }
    }
}

/// Kick off dialback for every queued route that maps onto a freshly opened
/// outbound connection and doesn't have state yet.
fn initiate_routes_for_dest(ctx: &mut Context, id: ConnId, dest: &DestKey) {
    let reuse = ctx.reuse();
    let routes: Vec<RouteKey> = ctx
        .queues
        .route_keys()
        .filter(|route| DestKey::for_route(route, reuse) == *dest)
        .cloned()
        .collect();

    let stream_id = match ctx.registry.get(id).and_then(|c| c.stream_id.clone()) {
        Some(id) => id,
        None => return,
    };

    for route in routes {
        let already_tracked = ctx.registry.get(id).map(|c| c.routes.contains_key(&route)).unwrap_or(true);
        if already_tracked {
            continue;
        }
        let key = dialback_key(&ctx.secret, route.from.as_str(), route.to.as_str(), &stream_id);
        if let Some(conn) = ctx.registry.get_mut(id) {
            conn.routes.insert(route.clone(), RouteState::begin_in_progress(Instant::now()));
        }
        ctx.engine.send_db_result(id, route, key);
    }
}

fn handle_db_result_reply(ctx: &mut Context, id: ConnId, route: RouteKey, result: DbType) {
    let reuse = ctx.reuse();
    let state = if result == DbType::Valid { RouteState::Valid } else { RouteState::Invalid };
    if let Some(conn) = ctx.registry.get_mut(id) {
        conn.routes.insert(route.clone(), state);
    }

    if result == DbType::Valid {
        let dest = ctx.registry.get(id).and_then(|c| c.dest.clone());
        if let Some(dest) = dest {
            let registry = &mut ctx.registry;
            ctx.queues.drain_for_connection(reuse, &dest, |r, stanza| {
                if *r == route {
                    match registry.get(id) {
                        Some(conn) => conn.stream.send(stanza),
                        None => Err(stanza),
                    }
                } else {
                    Err(stanza)
                }
            });
        }
    } else {
        let router = ctx.router.clone();
        ctx.queues.bounce_route(&route, BounceReason::RemoteConnectionFailed, |reply| {
            let _ = router.send(reply);
        });
    }
}

fn handle_db_result_assertion(ctx: &mut Context, id: ConnId, route: RouteKey, key: String) {
    let from_dest = DestKey::Host(route.from.clone());
    if let Some(existing_id) = ctx.registry.find_out(&from_dest) {
        if let Some(stream_id) = ctx.registry.get(existing_id).and_then(|c| c.stream_id.clone()) {
            let inbound_stream_id = ctx.registry.get(id).and_then(|c| c.stream_id.clone()).unwrap_or_default();
            mark_verify_sent(ctx, existing_id);
            ctx.engine.send_db_verify(stream_id, route, inbound_stream_id, key);
            return;
        }
    }

    ctx.pending_verifies
        .entry(from_dest.clone())
        .or_default()
        .push(PendingVerify { inbound_id: id, route, key });
    start_resolution_for_verify(ctx, &from_dest);
}

fn start_resolution_for_verify(ctx: &mut Context, dest: &DestKey) {
    let now = Instant::now();
    match ctx.dns.lookup(dest.to_domain(), now) {
        crate::dns::LookupStatus::Ready(candidates) => ctx.engine.connect(dest.clone(), candidates),
        crate::dns::LookupStatus::Pending => {}
        crate::dns::LookupStatus::Negative => deny_pending_verifies(ctx, dest),
    }
}

fn deny_pending_verifies(ctx: &mut Context, dest: &DestKey) {
    if let Some(pending) = ctx.pending_verifies.remove(dest) {
        for verify in pending {
            ctx.engine.send_db_result_reply(verify.inbound_id, verify.route, DbType::Invalid);
        }
    }
}

fn flush_pending_verifies(ctx: &mut Context, dest: &DestKey, verify_conn_id: ConnId) {
    let Some(pending) = ctx.pending_verifies.remove(dest) else { return };
    let Some(stream_id) = ctx.registry.get(verify_conn_id).and_then(|c| c.stream_id.clone()) else {
        ctx.pending_verifies.insert(dest.clone(), pending);
        return;
    };
    for verify in pending {
        let inbound_stream_id = ctx.registry.get(verify.inbound_id).and_then(|c| c.stream_id.clone()).unwrap_or_default();
        mark_verify_sent(ctx, verify_conn_id);
        ctx.engine.send_db_verify(stream_id.clone(), verify.route, inbound_stream_id, verify.key);
    }
}

/// Record that a `<db:verify>` request was just sent on `id`. Feeds the
/// phase-2 sweep check (§4.6) that closes an outbound connection still
/// waiting on a verify reply past `check_queue`.
fn mark_verify_sent(ctx: &mut Context, id: ConnId) {
    if let Some(conn) = ctx.registry.get_mut(id) {
        conn.verify_count += 1;
        conn.last_verify = Some(Instant::now());
    }
}

fn handle_db_verify_request(ctx: &mut Context, id: ConnId, route: RouteKey, verify_id: String, key: String) {
    // The key is derived from the stream id carried in the `<db:verify>`
    // element itself (the id the peer assigned to the original stream
    // being vouched for), not from any connection of ours.
    let expected = dialback_key(&ctx.secret, route.from.as_str(), route.to.as_str(), &verify_id);
    let result = if expected == key { DbType::Valid } else { DbType::Invalid };
    ctx.engine.send_db_verify_reply(id, route, verify_id, result);
}

fn handle_db_verify_reply(ctx: &mut Context, id: ConnId, route: RouteKey, result: DbType) {
    if let Some(conn) = ctx.registry.get_mut(id) {
        conn.verify_count = conn.verify_count.saturating_sub(1);
    }
    ctx.engine.send_db_result_reply(id, route, result);
}
