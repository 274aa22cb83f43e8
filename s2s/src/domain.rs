//! Domain canonicalization and the two key types that identify routes and
//! destinations (spec §3, "Route Key / Identity").

use std::fmt;

use crate::error::{Error, Result};

/// A domain name, canonicalized by IDN nameprep (RFC 3491) the same way
/// [`jid::Jid`] canonicalizes the domain part of a Jabber ID.
///
/// Empty strings are rejected: every route endpoint must name a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    /// Canonicalize `raw` via nameprep. Fails if the result is empty or
    /// nameprep itself rejects the input (bidi violations, prohibited
    /// characters, etc).
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Nameprep(raw.to_string()));
        }
        let prepped = stringprep::nameprep(raw).map_err(|_| Error::Nameprep(raw.to_string()))?;
        if prepped.is_empty() {
            return Err(Error::Nameprep(raw.to_string()));
        }
        Ok(Domain(prepped.into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniquely identifies a directed, authenticated delivery channel between a
/// local virtual host and a remote peer domain.
///
/// Rendered on the wire (and used for logging) as `from/to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub from: Domain,
    pub to: Domain,
}

impl RouteKey {
    pub fn new(from: Domain, to: Domain) -> Self {
        RouteKey { from, to }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

/// Identifies which outbound TCP connection a route maps to.
///
/// When connection reuse is enabled this is just the remote domain, since one
/// socket per peer host carries every route to it. When reuse is disabled,
/// the `from` domain is folded in too, so each route gets its own socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestKey {
    Host(Domain),
    Pair(Domain, Domain),
}

impl DestKey {
    pub fn for_route(route: &RouteKey, reuse: bool) -> Self {
        if reuse {
            DestKey::Host(route.to.clone())
        } else {
            DestKey::Pair(route.from.clone(), route.to.clone())
        }
    }

    /// The remote domain this destination key ultimately resolves to.
    pub fn to_domain(&self) -> &Domain {
        match self {
            DestKey::Host(to) => to,
            DestKey::Pair(_, to) => to,
        }
    }
}

impl fmt::Display for DestKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DestKey::Host(to) => write!(f, "{}", to),
            DestKey::Pair(from, to) => write!(f, "{}/{}", from, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_domain() {
        assert!(Domain::new("").is_err());
    }

    #[test]
    fn lowercases_via_nameprep() {
        let d = Domain::new("ExAmple.COM").unwrap();
        assert_eq!(d.as_str(), "example.com");
    }

    #[test]
    fn route_key_renders_from_slash_to() {
        let from = Domain::new("a.example").unwrap();
        let to = Domain::new("b.example").unwrap();
        let key = RouteKey::new(from, to);
        assert_eq!(key.to_string(), "a.example/b.example");
    }

    #[test]
    fn dest_key_host_mode_ignores_from() {
        let from1 = Domain::new("a.example").unwrap();
        let from2 = Domain::new("a2.example").unwrap();
        let to = Domain::new("p.example").unwrap();
        let k1 = DestKey::for_route(&RouteKey::new(from1, to.clone()), true);
        let k2 = DestKey::for_route(&RouteKey::new(from2, to), true);
        assert_eq!(k1, k2);
    }

    #[test]
    fn dest_key_no_reuse_mode_distinguishes_from() {
        let from1 = Domain::new("a.example").unwrap();
        let from2 = Domain::new("a2.example").unwrap();
        let to = Domain::new("p.example").unwrap();
        let k1 = DestKey::for_route(&RouteKey::new(from1, to.clone()), false);
        let k2 = DestKey::for_route(&RouteKey::new(from2, to), false);
        assert_ne!(k1, k2);
    }
}
