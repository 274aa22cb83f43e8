//! Host Table (spec §4.8): virtual-host records keyed by canonical domain.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::domain::Domain;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    Optional,
    Required,
}

impl VerifyMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(VerifyMode::None),
            "optional" => Some(VerifyMode::Optional),
            "required" => Some(VerifyMode::Required),
            _ => None,
        }
    }
}

/// TLS identity a virtual host presents when it is the SNI-selected server
/// identity for an inbound connection (spec §4.8: "registered with the
/// stream engine's TLS plugin as server identities keyed by realm").
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub pemfile: PathBuf,
    pub cachain: Option<PathBuf>,
    pub verify_mode: VerifyMode,
}

/// {realm, optional TLS identity} — spec §3 "Host record". Immutable after
/// startup.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub domain: Domain,
    pub realm: String,
    pub tls: Option<TlsIdentity>,
}

#[derive(Debug, Clone, Default)]
pub struct HostTable {
    hosts: HashMap<Domain, HostRecord>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw fields as read out of one `local.id` config entry (see
    /// [`crate::config`]); `domain` is nameprep'd here so callers of the
    /// table never have to.
    pub fn insert(
        &mut self,
        raw_domain: &str,
        realm: Option<String>,
        pemfile: Option<PathBuf>,
        cachain: Option<PathBuf>,
        verify_mode: Option<String>,
    ) -> Result<()> {
        let domain = Domain::new(raw_domain)?;
        let realm = realm.unwrap_or_else(|| domain.as_str().to_string());
        let tls = match pemfile {
            Some(pemfile) => {
                let verify_mode = match verify_mode {
                    Some(mode) => VerifyMode::parse(&mode)
                        .ok_or_else(|| Error::Config(format!("unknown verify-mode {:?}", mode)))?,
                    None => VerifyMode::None,
                };
                Some(TlsIdentity { pemfile, cachain, verify_mode })
            }
            None => None,
        };
        self.hosts.insert(domain.clone(), HostRecord { domain, realm, tls });
        Ok(())
    }

    pub fn get(&self, domain: &Domain) -> Option<&HostRecord> {
        self.hosts.get(domain)
    }

    pub fn is_local(&self, domain: &Domain) -> bool {
        self.hosts.contains_key(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }
}
