//! Router Link (spec §4.5): the single persistent connection to the router,
//! authenticated as an XMPP component (the router speaks the same
//! component-handshake protocol client software uses, just on the other
//! side of the routing bus) and reconnected with backoff when it drops.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_xmpp::connect::{DnsConfig, TcpServerConnector};
use tokio_xmpp::xmlstream::Timeouts;
use tokio_xmpp::{Component, Stanza};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub pass: String,
    pub retry_init: u32,
    pub retry_lost: u32,
    pub retry_sleep: Duration,
}

/// Something the rest of the connector needs to learn about the router
/// link's state.
#[derive(Debug)]
pub enum RouterEvent {
    Connected,
    Stanza(Stanza),
    /// The link dropped; `attempt` is 1-based and counts consecutive
    /// failures since the last successful connection.
    Lost { attempt: u32 },
    /// `retry_left` consecutive attempts all failed; the process should
    /// treat this as fatal (spec §3 "Router Link").
    GivenUp,
}

/// Handle held by the main loop to submit outbound stanzas to the router.
#[derive(Clone)]
pub struct RouterLinkHandle {
    outbound: mpsc::UnboundedSender<Stanza>,
}

impl RouterLinkHandle {
    pub fn send(&self, stanza: Stanza) -> Result<()> {
        self.outbound
            .send(stanza)
            .map_err(|_| Error::Fatal("router link task is gone".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn for_test(outbound: mpsc::UnboundedSender<Stanza>) -> Self {
        RouterLinkHandle { outbound }
    }
}

/// Spawn the task that owns the router component connection and drives its
/// reconnect loop. Returns a handle for submitting outbound stanzas and the
/// receiver side of the event channel the main loop selects on.
pub fn spawn(config: RouterConfig) -> (RouterLinkHandle, mpsc::UnboundedReceiver<RouterEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(config, outbound_rx, events_tx));
    (RouterLinkHandle { outbound: outbound_tx }, events_rx)
}

async fn run(
    config: RouterConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Stanza>,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
) {
    let mut attempt: u32 = 0;
    // `retry_init` bounds the very first connection attempt; once any
    // connection has ever succeeded, subsequent reconnects are bounded by
    // `retry_lost` instead (jabberd2's historical distinction between
    // startup failures and mid-session link loss).
    let mut ever_connected = false;

    loop {
        let limit = if ever_connected { config.retry_lost } else { config.retry_init };
        if limit > 0 && attempt >= limit {
            let _ = events_tx.send(RouterEvent::GivenUp);
            return;
        }

        match connect_once(&config).await {
            Ok(mut component) => {
                attempt = 0;
                ever_connected = true;
                let _ = events_tx.send(RouterEvent::Connected);

                loop {
                    tokio::select! {
                        incoming = component.next() => {
                            match incoming {
                                Some(element) => {
                                    match Stanza::try_from(element) {
                                        Ok(stanza) => {
                                            if events_tx.send(RouterEvent::Stanza(stanza)).is_err() {
                                                return;
                                            }
                                        }
                                        Err(_) => continue,
                                    }
                                }
                                None => break,
                            }
                        }
                        outgoing = outbound_rx.recv() => {
                            match outgoing {
                                Some(stanza) => {
                                    let element: Element = stanza.into();
                                    if component.send(element).await.is_err() {
                                        break;
                                    }
                                }
                                None => return,
                            }
                        }
                    }
                }
            }
            Err(_) => {}
        }

        attempt += 1;
        if events_tx.send(RouterEvent::Lost { attempt }).is_err() {
            return;
        }
        sleep(config.retry_sleep).await;
    }
}

async fn connect_once(config: &RouterConfig) -> Result<Component<TcpServerConnector>> {
    let jid = format!("{}", config.id);
    let dns = DnsConfig::addr(&format!("{}:{}", config.ip, config.port));
    Component::new_with_connector(&jid, &config.pass, TcpServerConnector::from(dns), Timeouts::tight())
        .await
        .map_err(|e| Error::Fatal(format!("router connection failed: {}", e)))
}
