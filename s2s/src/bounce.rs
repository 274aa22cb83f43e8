//! Bounce Engine (spec §4.7): turns an undeliverable queued stanza into a
//! stanza-error reply addressed back to its original sender.

use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};
use tokio_xmpp::Stanza;

/// Why a queued stanza is being bounced; maps 1:1 onto the stanza-error
/// condition reported to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceReason {
    /// DNS resolution of the destination failed (NXDOMAIN or no usable
    /// SRV/A/AAAA records).
    RemoteServerNotFound,
    /// The destination was reachable but no usable stream/dialback state
    /// was reached before `check_queue` elapsed.
    RemoteServerTimeout,
    /// The TCP connection attempt itself failed.
    RemoteConnectionFailed,
}

impl BounceReason {
    fn defined_condition(self) -> DefinedCondition {
        match self {
            BounceReason::RemoteServerNotFound => DefinedCondition::RemoteServerNotFound,
            BounceReason::RemoteServerTimeout => DefinedCondition::RemoteServerTimeout,
            BounceReason::RemoteConnectionFailed => DefinedCondition::RemoteServerTimeout,
        }
    }

    fn error_type(self) -> ErrorType {
        match self {
            BounceReason::RemoteServerNotFound => ErrorType::Cancel,
            BounceReason::RemoteServerTimeout | BounceReason::RemoteConnectionFailed => {
                ErrorType::Wait
            }
        }
    }
}

/// Rewrite `stanza` into an error reply: `from`/`to` swapped, an `<error/>`
/// child appended with `reason`'s condition. Stanzas that are already of
/// type `error` are dropped rather than re-bounced (mirrors the one-shot
/// nature of stanza errors in RFC 6120 §8.3.1) and `None` is returned.
pub fn into_error_reply(stanza: Stanza, reason: BounceReason) -> Option<Stanza> {
    let error = StanzaError::new(reason.error_type(), reason.defined_condition(), "en", "");
    match stanza {
        Stanza::Iq(iq) => {
            if matches!(iq.payload, IqType::Error(_)) {
                return None;
            }
            Some(Stanza::Iq(Iq {
                from: iq.to,
                to: iq.from,
                id: iq.id,
                payload: IqType::Error(error),
            }))
        }
        Stanza::Message(mut message) => {
            if message.type_ == xmpp_parsers::message::MessageType::Error {
                return None;
            }
            let from = message.from.take();
            let to = message.to.take();
            message.from = to;
            message.to = from;
            message.type_ = xmpp_parsers::message::MessageType::Error;
            message.payloads.push(error.into());
            Some(Stanza::Message(message))
        }
        Stanza::Presence(mut presence) => {
            if presence.type_ == xmpp_parsers::presence::Type::Error {
                return None;
            }
            let from = presence.from.take();
            let to = presence.to.take();
            presence.from = to;
            presence.to = from;
            presence.type_ = xmpp_parsers::presence::Type::Error;
            presence.payloads.push(error.into());
            Some(Stanza::Presence(presence))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jid::Jid;
    use std::str::FromStr;

    #[test]
    fn message_bounce_swaps_from_to_and_sets_error() {
        let mut message = Message::chat(Jid::from_str("v@b.example").unwrap());
        message.from = Some(Jid::from_str("u@a.example").unwrap());
        let bounced = into_error_reply(Stanza::Message(message), BounceReason::RemoteServerNotFound)
            .expect("not already an error");
        match bounced {
            Stanza::Message(m) => {
                assert_eq!(m.from.unwrap().to_string(), "v@b.example");
                assert_eq!(m.to.unwrap().to_string(), "u@a.example");
                assert_eq!(m.type_, xmpp_parsers::message::MessageType::Error);
                assert_eq!(m.payloads.len(), 1);
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn already_error_message_is_dropped() {
        let mut message = Message::error(Jid::from_str("v@b.example").unwrap());
        message.from = Some(Jid::from_str("u@a.example").unwrap());
        assert!(into_error_reply(Stanza::Message(message), BounceReason::RemoteServerTimeout).is_none());
    }

    #[test]
    fn presence_bounce_swaps_from_to() {
        let mut presence = Presence::available();
        presence.from = Some(Jid::from_str("u@a.example").unwrap());
        presence.to = Some(Jid::from_str("v@b.example").unwrap());
        let bounced = into_error_reply(Stanza::Presence(presence), BounceReason::RemoteConnectionFailed)
            .expect("not already an error");
        match bounced {
            Stanza::Presence(p) => {
                assert_eq!(p.from.unwrap().to_string(), "v@b.example");
                assert_eq!(p.to.unwrap().to_string(), "u@a.example");
                assert_eq!(p.type_, xmpp_parsers::presence::Type::Error);
            }
            _ => panic!("expected presence"),
        }
    }
}
