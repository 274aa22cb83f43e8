//! DNS cache and resolver adapter (spec §4.2).
//!
//! Resolution itself happens on ordinary `tokio::spawn`ed tasks (DNS lookups
//! are one of the few things in this connector that are allowed to take a
//! while); the cache and bad-endpoint table are plain data owned by the main
//! loop and only ever touched from it, consistent with this connector's
//! single-threaded, message-passing concurrency model (spec §5).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::domain::Domain;

/// One candidate endpoint to try connecting to, in the order callers should
/// attempt them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub addr: IpAddr,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Outcome of [`DnsCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum LookupStatus {
    /// A resolution is in flight; try again later.
    Pending,
    /// Resolution succeeded; these candidates are current.
    Ready(Vec<Candidate>),
    /// Resolution failed (NXDOMAIN or no usable records).
    Negative,
}

struct Entry {
    pending: bool,
    candidates: Vec<Candidate>,
    init_time: Instant,
    /// `None` while pending; set once a result (positive or negative)
    /// arrives, governing when the sweep removes the entry.
    expiry: Option<Instant>,
}

/// Event reported back to the main loop once a spawned lookup task
/// completes. Carried over an `mpsc` channel rather than a shared future so
/// that cancelled lookups (the name was zapped before the task finished) can
/// simply be ignored when they arrive late.
#[derive(Debug)]
pub enum DnsEvent {
    Resolved {
        name: Domain,
        candidates: Vec<Candidate>,
        ttl: Duration,
    },
    Negative {
        name: Domain,
    },
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub srv_prefixes: Vec<String>,
    pub resolve_ipv6: bool,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub bad_host_timeout: Duration,
    pub no_cache: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            srv_prefixes: vec!["_xmpp-server._tcp".to_string()],
            resolve_ipv6: true,
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(900),
            bad_host_timeout: Duration::from_secs(900),
            no_cache: false,
        }
    }
}

const TTL_FLOOR: Duration = Duration::from_secs(5);

pub struct DnsCache {
    entries: HashMap<Domain, Entry>,
    bad: HashMap<(IpAddr, u16), Instant>,
    config: DnsConfig,
    resolver: Arc<TokioAsyncResolver>,
    events_tx: mpsc::UnboundedSender<DnsEvent>,
}

impl DnsCache {
    pub fn new(
        resolver: Arc<TokioAsyncResolver>,
        config: DnsConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DnsEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            DnsCache {
                entries: HashMap::new(),
                bad: HashMap::new(),
                config,
                resolver,
                events_tx,
            },
            events_rx,
        )
    }

    /// Look up `name`, spawning a resolution task the first time it's seen
    /// (or once its cache entry has expired).
    pub fn lookup(&mut self, name: &Domain, now: Instant) -> LookupStatus {
        if let Some(entry) = self.entries.get(name) {
            if entry.pending {
                return LookupStatus::Pending;
            }
            if let Some(expiry) = entry.expiry {
                if now < expiry {
                    return if entry.candidates.is_empty() {
                        LookupStatus::Negative
                    } else {
                        LookupStatus::Ready(self.filter_bad(&entry.candidates, now))
                    };
                }
            }
            // Expired: fall through and re-resolve.
            self.entries.remove(name);
        }

        self.entries.insert(
            name.clone(),
            Entry {
                pending: true,
                candidates: Vec::new(),
                init_time: now,
                expiry: None,
            },
        );
        self.spawn_lookup(name.clone());
        LookupStatus::Pending
    }

    fn spawn_lookup(&self, name: Domain) {
        let resolver = Arc::clone(&self.resolver);
        let tx = self.events_tx.clone();
        let prefixes = self.config.srv_prefixes.clone();
        let resolve_ipv6 = self.config.resolve_ipv6;
        tokio::spawn(async move {
            let outcome = resolve_one(&resolver, &name, &prefixes, resolve_ipv6).await;
            let event = match outcome {
                Some((candidates, ttl)) => DnsEvent::Resolved {
                    name,
                    candidates,
                    ttl,
                },
                None => DnsEvent::Negative { name },
            };
            // The receiver may be gone if the cache was torn down; that's fine.
            let _ = tx.send(event);
        });
    }

    /// Apply a [`DnsEvent`] received from a completed lookup task. Events
    /// for names that were zapped in the meantime (no entry, or a newer
    /// pending entry for the same name) are dropped silently.
    pub fn complete(&mut self, event: DnsEvent, now: Instant) {
        match event {
            DnsEvent::Resolved {
                name,
                candidates,
                ttl,
            } => {
                let Some(entry) = self.entries.get_mut(&name) else {
                    return;
                };
                if !entry.pending {
                    return;
                }
                let clamped = ttl.clamp(self.config.min_ttl, self.config.max_ttl).max(TTL_FLOOR);
                entry.pending = false;
                entry.candidates = candidates;
                entry.expiry = Some(now + clamped);
            }
            DnsEvent::Negative { name } => {
                let Some(entry) = self.entries.get_mut(&name) else {
                    return;
                };
                if !entry.pending {
                    return;
                }
                entry.pending = false;
                entry.candidates = Vec::new();
                entry.expiry = Some(now + self.config.min_ttl.max(TTL_FLOOR));
            }
        }
    }

    /// Remove a pending entry whose lookup has exceeded `check_queue`
    /// seconds since it was started, per the queue-expiry sweep phase.
    pub fn zap_if_timed_out(&mut self, name: &Domain, now: Instant, check_queue: Duration) -> bool {
        if let Some(entry) = self.entries.get(name) {
            if entry.pending && now.saturating_duration_since(entry.init_time) >= check_queue {
                self.entries.remove(name);
                return true;
            }
        }
        false
    }

    pub fn is_pending(&self, name: &Domain) -> bool {
        self.entries.get(name).map(|e| e.pending).unwrap_or(false)
    }

    pub fn pending_init_time(&self, name: &Domain) -> Option<Instant> {
        self.entries.get(name).and_then(|e| if e.pending { Some(e.init_time) } else { None })
    }

    /// Record a connect timeout to `(ip, port)` in the negative cache.
    pub fn mark_bad(&mut self, addr: IpAddr, port: u16, now: Instant) {
        self.bad.insert((addr, port), now + self.config.bad_host_timeout);
    }

    pub fn is_bad(&self, addr: IpAddr, port: u16, now: Instant) -> bool {
        self.bad
            .get(&(addr, port))
            .map(|expiry| now < *expiry)
            .unwrap_or(false)
    }

    fn filter_bad(&self, candidates: &[Candidate], now: Instant) -> Vec<Candidate> {
        candidates
            .iter()
            .copied()
            .filter(|c| !self.is_bad(c.addr, c.port, now))
            .collect()
    }

    /// DNS-cache sweep (spec §4.6 phase 6): drop expired non-pending
    /// entries and expired bad-endpoint entries. Runs on its own
    /// `check_dnscache` cadence, independent from the main sweep.
    pub fn sweep(&mut self, now: Instant) {
        self.entries
            .retain(|_, entry| entry.pending || entry.expiry.map(|e| now < e).unwrap_or(true));
        self.bad.retain(|_, expiry| now < *expiry);
    }
}

/// Perform the actual SRV-then-A/AAAA resolution sequence for one domain.
///
/// Returns `None` on total failure (NXDOMAIN / no usable records); otherwise
/// an ordered candidate list plus the TTL to cache it for.
async fn resolve_one(
    resolver: &TokioAsyncResolver,
    name: &Domain,
    srv_prefixes: &[String],
    resolve_ipv6: bool,
) -> Option<(Vec<Candidate>, Duration)> {
    let ascii_name = idna::domain_to_ascii(name.as_str()).ok()?;

    // If the destination was supplied as a literal address, no lookup is
    // needed at all; treat it as a single high-priority candidate with a
    // generous TTL since it can never change underneath us.
    if let Ok(ip) = ascii_name.parse::<IpAddr>() {
        return Some((
            vec![Candidate {
                addr: ip,
                port: 5269,
                priority: 0,
                weight: 0,
            }],
            Duration::from_secs(3600),
        ));
    }

    for prefix in srv_prefixes {
        let srv_name = format!("{}.{}.", prefix, ascii_name);
        if let Ok(srv_lookup) = resolver.srv_lookup(srv_name).await {
            let mut candidates = Vec::new();
            for srv in srv_lookup.iter() {
                let target = srv.target().to_ascii();
                let port = srv.port();
                if let Some(mut addrs) = resolve_host(resolver, &target, resolve_ipv6).await {
                    for addr in addrs.drain(..) {
                        candidates.push(Candidate {
                            addr,
                            port,
                            priority: srv.priority(),
                            weight: srv.weight(),
                        });
                    }
                }
            }
            if !candidates.is_empty() {
                order_candidates(&mut candidates);
                // hickory's SrvLookup does not expose a convenient
                // minimum-TTL accessor; fall back to a conservative
                // default which `min_ttl`/`max_ttl` will clamp anyway.
                return Some((candidates, Duration::from_secs(300)));
            }
        }
    }

    // No SRV records (or none usable): fall back to A/AAAA on the bare name
    // at the default s2s port.
    let addrs = resolve_host(resolver, &ascii_name, resolve_ipv6).await?;
    if addrs.is_empty() {
        return None;
    }
    let mut candidates: Vec<Candidate> = addrs
        .into_iter()
        .map(|addr| Candidate {
            addr,
            port: 5269,
            priority: 0,
            weight: 0,
        })
        .collect();
    order_candidates(&mut candidates);
    Some((candidates, Duration::from_secs(300)))
}

/// Resolve `host` to addresses. `resolve_ipv6` only affects whether AAAA
/// results are kept; the resolver itself is constructed once at startup
/// (see [`crate::mainloop`]) with the matching [`LookupIpStrategy`].
async fn resolve_host(
    resolver: &TokioAsyncResolver,
    host: &str,
    resolve_ipv6: bool,
) -> Option<Vec<IpAddr>> {
    let lookup = resolver.lookup_ip(host).await.ok()?;
    Some(
        lookup
            .iter()
            .filter(|addr| resolve_ipv6 || addr.is_ipv4())
            .collect(),
    )
}

/// Order candidates by ascending priority, shuffle within equal-priority
/// groups by weight (RFC 2782 weighting, simplified to a weighted shuffle
/// rather than the full repeated-draw algorithm), and, only when IPv6
/// resolution is enabled, prefer AAAA addresses over A addresses within an
/// otherwise-equal group.
fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|c| c.priority);
    let mut start = 0;
    while start < candidates.len() {
        let priority = candidates[start].priority;
        let end = candidates[start..]
            .iter()
            .position(|c| c.priority != priority)
            .map(|off| start + off)
            .unwrap_or(candidates.len());
        let group = &mut candidates[start..end];
        weighted_shuffle(group);
        group.sort_by_key(|c| std::cmp::Reverse(c.addr.is_ipv6()));
        start = end;
    }
}

fn weighted_shuffle(group: &mut [Candidate]) {
    if group.len() <= 1 {
        return;
    }
    let mut rng = rand::thread_rng();
    if group.iter().all(|c| c.weight == 0) {
        group.shuffle(&mut rng);
        return;
    }
    // Simple weighted shuffle: repeatedly pick a remaining element with
    // probability proportional to its weight (+1, so zero-weight entries
    // still get a chance, matching RFC 2782's guidance).
    let mut remaining: Vec<Candidate> = group.to_vec();
    let mut ordered = Vec::with_capacity(group.len());
    while !remaining.is_empty() {
        let total: u32 = remaining.iter().map(|c| c.weight as u32 + 1).sum();
        let mut pick = rand::Rng::gen_range(&mut rng, 0..total);
        let mut idx = 0;
        for (i, c) in remaining.iter().enumerate() {
            let w = c.weight as u32 + 1;
            if pick < w {
                idx = i;
                break;
            }
            pick -= w;
        }
        ordered.push(remaining.remove(idx));
    }
    group.copy_from_slice(&ordered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn candidate(addr: &str, priority: u16, weight: u16) -> Candidate {
        Candidate {
            addr: addr.parse().unwrap(),
            port: 5269,
            priority,
            weight,
        }
    }

    #[test]
    fn orders_by_priority_first() {
        let mut candidates = vec![
            candidate("10.0.0.2", 10, 0),
            candidate("10.0.0.1", 1, 0),
        ];
        order_candidates(&mut candidates);
        assert_eq!(candidates[0].addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(candidates[1].addr, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn ipv6_preferred_within_same_priority() {
        let mut candidates = vec![
            candidate("10.0.0.1", 1, 0),
            candidate("::1", 1, 0),
        ];
        order_candidates(&mut candidates);
        assert!(candidates[0].addr.is_ipv6());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_entry_filters_candidate_until_expiry() {
        let resolver = Arc::new(
            TokioAsyncResolver::tokio_from_system_conf().expect("system resolver config"),
        );
        let (mut cache, _rx) = DnsCache::new(resolver, DnsConfig::default());
        let now = Instant::now();
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        cache.mark_bad(addr, 5269, now);
        assert!(cache.is_bad(addr, 5269, now));
        tokio::time::advance(DnsConfig::default().bad_host_timeout + Duration::from_secs(1)).await;
        assert!(!cache.is_bad(addr, 5269, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_lookup_zapped_after_check_queue() {
        let resolver = Arc::new(
            TokioAsyncResolver::tokio_from_system_conf().expect("system resolver config"),
        );
        let (mut cache, _rx) = DnsCache::new(resolver, DnsConfig::default());
        let name = Domain::new("nx.example").unwrap();
        let now = Instant::now();
        assert_eq!(cache.lookup(&name, now), LookupStatus::Pending);
        assert!(!cache.zap_if_timed_out(&name, now, Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.zap_if_timed_out(&name, Instant::now(), Duration::from_secs(60)));
        assert!(!cache.is_pending(&name));
    }
}
