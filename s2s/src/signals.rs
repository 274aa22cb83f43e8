//! Signal handling (spec §5): SIGINT/SIGTERM request shutdown, SIGHUP
//! requests a log-rotate/config-reload, SIGPIPE is installed and ignored so
//! a peer closing its read side doesn't kill the process. Latched as plain
//! booleans read at the top of the main loop rather than a shared atomic,
//! since everything here already lives on the one current-thread runtime.

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::Result;

pub struct Signals {
    sigint: Signal,
    sigterm: Signal,
    sighup: Signal,
    sigpipe: Signal,
}

impl Signals {
    pub fn install() -> Result<Self> {
        Ok(Signals {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            sigpipe: signal(SignalKind::pipe())?,
        })
    }

    /// Wait for the next signal relevant to the main loop; SIGPIPE is
    /// consumed here but never reported, it exists purely so the kernel's
    /// default action (terminate the process) never fires.
    pub async fn recv(&mut self) -> SignalEvent {
        loop {
            tokio::select! {
                _ = self.sigint.recv() => return SignalEvent::Shutdown,
                _ = self.sigterm.recv() => return SignalEvent::Shutdown,
                _ = self.sighup.recv() => return SignalEvent::Reload,
                _ = self.sigpipe.recv() => continue,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}
