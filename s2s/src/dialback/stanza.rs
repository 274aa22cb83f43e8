//! Wire elements for the `jabber:server:dialback` extension.
//!
//! These are hand-derived with `xso` the same way the rest of the XMPP stack
//! derives its stanza payloads (see e.g. `xmpp_parsers::ping::Ping`); they
//! live here rather than in `xmpp-parsers` because Server Dialback is not a
//! client-facing extension that crate concerns itself with.

use xso::{AsXml, FromXml};

pub mod ns {
    pub const DIALBACK: &str = "jabber:server:dialback";
}

/// `<db:result/>`, sent either to assert a route (outgoing, no `type`, body
/// is the key) or to grant/deny one (incoming response, `type='valid'` or
/// `type='invalid'`, no body).
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::DIALBACK, name = "result")]
pub struct DbResult {
    #[xml(attribute)]
    pub from: String,
    #[xml(attribute)]
    pub to: String,
    #[xml(attribute(default, name = "type"))]
    pub type_: Option<String>,
    #[xml(text(default))]
    pub key: Option<String>,
}

impl DbResult {
    pub fn dialback_type(&self) -> Option<DbType> {
        self.type_.as_deref().and_then(DbType::parse)
    }
}

/// `<db:verify/>`, sent by the recipient of a `<db:result>` to the
/// originating domain to confirm the key, and replied to by that domain.
#[derive(FromXml, AsXml, PartialEq, Debug, Clone)]
#[xml(namespace = ns::DIALBACK, name = "verify")]
pub struct DbVerify {
    #[xml(attribute)]
    pub from: String,
    #[xml(attribute)]
    pub to: String,
    #[xml(attribute)]
    pub id: String,
    #[xml(attribute(default, name = "type"))]
    pub type_: Option<String>,
    #[xml(text(default))]
    pub key: Option<String>,
}

impl DbVerify {
    pub fn dialback_type(&self) -> Option<DbType> {
        self.type_.as_deref().and_then(DbType::parse)
    }
}

/// The outcome carried by a `type` attribute on `<db:result>`/`<db:verify>`.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DbType {
    Valid,
    Invalid,
}

impl DbType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(DbType::Valid),
            "invalid" => Some(DbType::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Valid => "valid",
            DbType::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;

    #[test]
    fn result_with_key_round_trips() {
        let elem: Element =
            "<db:result xmlns:db='jabber:server:dialback' from='a.example' to='b.example'>thekey</db:result>"
                .parse()
                .unwrap();
        let parsed = DbResult::try_from(elem).unwrap();
        assert_eq!(parsed.from, "a.example");
        assert_eq!(parsed.to, "b.example");
        assert_eq!(parsed.key.as_deref(), Some("thekey"));
        assert_eq!(parsed.dialback_type(), None);
    }

    #[test]
    fn result_with_type_valid() {
        let elem: Element =
            "<db:result xmlns:db='jabber:server:dialback' from='b.example' to='a.example' type='valid'/>"
                .parse()
                .unwrap();
        let parsed = DbResult::try_from(elem).unwrap();
        assert_eq!(parsed.dialback_type(), Some(DbType::Valid));
        assert_eq!(parsed.key, None);
    }

    #[test]
    fn verify_round_trips() {
        let elem: Element =
            "<db:verify xmlns:db='jabber:server:dialback' from='b.example' to='a.example' id='s1'>thekey</db:verify>"
                .parse()
                .unwrap();
        let parsed = DbVerify::try_from(elem).unwrap();
        assert_eq!(parsed.id, "s1");
        assert_eq!(parsed.key.as_deref(), Some("thekey"));
    }
}
