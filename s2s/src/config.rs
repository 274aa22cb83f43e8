//! Config file schema and loader (spec §6, ambient §10).
//!
//! The config file is XML-shaped, the same way `minidom::Element` is already
//! used everywhere else in this stack to model wire elements; there's no
//! reason to reach for a different parser just because this document never
//! goes over a socket.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use minidom::Element;

use crate::error::{Error, Result};
use crate::hosts::HostTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    File(PathBuf),
    Syslog { facility: String, ident: String },
}

#[derive(Debug, Clone)]
pub struct RouterSection {
    pub ip: String,
    pub port: u16,
    pub pass: String,
    pub pemfile: Option<PathBuf>,
    pub retry_init: u32,
    pub retry_lost: u32,
    pub retry_sleep: Duration,
    pub non_default: bool,
}

#[derive(Debug, Clone)]
pub struct LocalSection {
    pub ip: String,
    pub origin: Option<String>,
    pub port: u16,
    pub secret: Option<String>,
    pub pemfile: Option<PathBuf>,
    pub cachain: Option<PathBuf>,
    pub verify_mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckSection {
    pub interval: Duration,
    pub queue: Duration,
    pub keepalive: Duration,
    pub idle: Duration,
    pub dnscache: Duration,
}

impl Default for CheckSection {
    fn default() -> Self {
        CheckSection {
            interval: Duration::from_secs(60),
            queue: Duration::from_secs(60),
            keepalive: Duration::ZERO,
            idle: Duration::from_secs(86400),
            dnscache: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupSection {
    pub srv_prefixes: Vec<String>,
    pub resolve_ipv6: bool,
    pub no_cache: bool,
    pub bad_host_timeout: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for LookupSection {
    fn default() -> Self {
        LookupSection {
            srv_prefixes: vec!["_xmpp-server._tcp".to_string()],
            resolve_ipv6: true,
            no_cache: false,
            bad_host_timeout: Duration::from_secs(900),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IoSection {
    pub max_fds: Option<u64>,
    pub max_stanza_size: Option<usize>,
}

impl Default for IoSection {
    fn default() -> Self {
        IoSection { max_fds: None, max_stanza_size: None }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub id: String,
    pub router: RouterSection,
    pub log_sink: LogSink,
    pub stats_packet: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub local: LocalSection,
    pub io: IoSection,
    pub check: CheckSection,
    pub lookup: LookupSection,
    pub out_conn_reuse: bool,
    pub hosts: HostTable,
}

impl Config {
    pub fn from_str(xml: &str) -> Result<Self> {
        let root: Element = xml.parse().map_err(Error::Xml)?;
        Self::from_element(&root)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    fn from_element(root: &Element) -> Result<Self> {
        let id = child_text(root, "id").ok_or_else(|| Error::Config("missing <id>".to_string()))?;

        let router_elem = root
            .get_child("router", root.ns())
            .ok_or_else(|| Error::Config("missing <router>".to_string()))?;
        let router = RouterSection {
            ip: child_text(router_elem, "ip").ok_or_else(|| Error::Config("missing <router><ip>".to_string()))?,
            port: child_text(router_elem, "port")
                .map(|s| parse_num(&s, "router.port"))
                .transpose()?
                .unwrap_or(5347),
            pass: child_text(router_elem, "pass").ok_or_else(|| Error::Config("missing <router><pass>".to_string()))?,
            pemfile: child_text(router_elem, "pemfile").map(PathBuf::from),
            retry_init: 3,
            retry_lost: 3,
            retry_sleep: Duration::from_secs(2),
            non_default: router_elem.get_child("non-default", router_elem.ns()).is_some(),
        };
        let router = apply_retry_section(router, router_elem)?;

        let log_sink = parse_log(root)?;
        let stats_packet = root
            .get_child("stats", root.ns())
            .and_then(|stats| child_text(stats, "packet"))
            .map(PathBuf::from);
        let pidfile = child_text(root, "pidfile").map(PathBuf::from);

        let local_elem = root
            .get_child("local", root.ns())
            .ok_or_else(|| Error::Config("missing <local>".to_string()))?;
        let local = LocalSection {
            ip: child_text(local_elem, "ip").unwrap_or_else(|| "0.0.0.0".to_string()),
            origin: child_text(local_elem, "origin"),
            port: child_text(local_elem, "port")
                .map(|s| parse_num(&s, "local.port"))
                .transpose()?
                .unwrap_or(5269),
            secret: child_text(local_elem, "secret"),
            pemfile: child_text(local_elem, "pemfile").map(PathBuf::from),
            cachain: child_text(local_elem, "cachain").map(PathBuf::from),
            verify_mode: child_text(local_elem, "verify-mode"),
        };

        let mut hosts = HostTable::new();
        for id_elem in local_elem.children().filter(|c| c.name() == "id") {
            let domain = id_elem.text();
            hosts.insert(
                domain.trim(),
                id_elem.attr("realm").map(str::to_string),
                id_elem.attr("pemfile").map(PathBuf::from),
                id_elem.attr("cachain").map(PathBuf::from),
                id_elem.attr("verify-mode").map(str::to_string),
            )?;
        }

        let io = parse_io(root)?;
        let check = parse_check(root)?;
        let lookup = parse_lookup(root)?;
        let out_conn_reuse = root.get_child("out-conn-reuse", root.ns()).is_some();

        Ok(Config {
            id,
            router,
            log_sink,
            stats_packet,
            pidfile,
            local,
            io,
            check,
            lookup,
            out_conn_reuse,
            hosts,
        })
    }
}

fn apply_retry_section(mut router: RouterSection, router_elem: &Element) -> Result<RouterSection> {
    if let Some(retry) = router_elem.get_child("retry", router_elem.ns()) {
        if let Some(init) = child_text(retry, "init") {
            router.retry_init = parse_num(&init, "router.retry.init")?;
        }
        if let Some(lost) = child_text(retry, "lost") {
            router.retry_lost = parse_num(&lost, "router.retry.lost")?;
        }
        if let Some(sleep) = child_text(retry, "sleep") {
            router.retry_sleep = Duration::from_secs(parse_num(&sleep, "router.retry.sleep")?);
        }
    }
    Ok(router)
}

fn parse_log(root: &Element) -> Result<LogSink> {
    let Some(log) = root.get_child("log", root.ns()) else {
        return Ok(LogSink::Stdout);
    };
    match log.attr("type").unwrap_or("stdout") {
        "stdout" => Ok(LogSink::Stdout),
        "file" => {
            let path = child_text(log, "file").ok_or_else(|| Error::Config("log type=file needs <file>".to_string()))?;
            Ok(LogSink::File(PathBuf::from(path)))
        }
        "syslog" => {
            let facility = child_text(log, "facility").unwrap_or_else(|| "daemon".to_string());
            let ident = child_text(log, "ident").unwrap_or_else(|| "s2s".to_string());
            Ok(LogSink::Syslog { facility, ident })
        }
        other => Err(Error::Config(format!("unknown log type {:?}", other))),
    }
}

fn parse_io(root: &Element) -> Result<IoSection> {
    let mut io = IoSection::default();
    let Some(elem) = root.get_child("io", root.ns()) else {
        return Ok(io);
    };
    if let Some(max_fds) = child_text(elem, "max_fds") {
        io.max_fds = Some(parse_num(&max_fds, "io.max_fds")?);
    }
    if let Some(limits) = elem.get_child("limits", elem.ns()) {
        if let Some(size) = child_text(limits, "stanzasize") {
            io.max_stanza_size = Some(parse_num::<usize>(&size, "io.limits.stanzasize")?);
        }
    }
    Ok(io)
}

fn parse_check(root: &Element) -> Result<CheckSection> {
    let mut check = CheckSection::default();
    let Some(elem) = root.get_child("check", root.ns()) else {
        return Ok(check);
    };
    if let Some(v) = child_text(elem, "interval") {
        check.interval = Duration::from_secs(parse_num(&v, "check.interval")?);
    }
    if let Some(v) = child_text(elem, "queue") {
        check.queue = Duration::from_secs(parse_num(&v, "check.queue")?);
    }
    if let Some(v) = child_text(elem, "keepalive") {
        check.keepalive = Duration::from_secs(parse_num(&v, "check.keepalive")?);
    }
    if let Some(v) = child_text(elem, "idle") {
        check.idle = Duration::from_secs(parse_num(&v, "check.idle")?);
    }
    if let Some(v) = child_text(elem, "dnscache") {
        check.dnscache = Duration::from_secs(parse_num(&v, "check.dnscache")?);
    }
    Ok(check)
}

fn parse_lookup(root: &Element) -> Result<LookupSection> {
    let mut lookup = LookupSection::default();
    let Some(elem) = root.get_child("lookup", root.ns()) else {
        return Ok(lookup);
    };
    let srvs: Vec<String> = elem.children().filter(|c| c.name() == "srv").map(|c| c.text()).collect();
    if !srvs.is_empty() {
        lookup.srv_prefixes = srvs;
    }
    lookup.resolve_ipv6 = elem.get_child("resolve-ipv6", elem.ns()).is_some();
    lookup.no_cache = elem.get_child("no-cache", elem.ns()).is_some();
    if let Some(v) = child_text(elem, "bad-host-timeout") {
        lookup.bad_host_timeout = Duration::from_secs(parse_num(&v, "lookup.bad-host-timeout")?);
    }
    if let Some(v) = child_text(elem, "min-ttl") {
        lookup.min_ttl = Duration::from_secs(parse_num(&v, "lookup.min-ttl")?);
    }
    if let Some(v) = child_text(elem, "max-ttl") {
        lookup.max_ttl = Duration::from_secs(parse_num(&v, "lookup.max-ttl")?);
    }
    Ok(lookup)
}

fn child_text(elem: &Element, name: &str) -> Option<String> {
    elem.get_child(name, elem.ns()).map(|c| c.text())
}

fn parse_num<T: FromStr>(raw: &str, field: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a valid number: {:?}", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        <s2s>
          <id>s2s.example</id>
          <router>
            <ip>127.0.0.1</ip>
            <port>5347</port>
            <user>s2s</user>
            <pass>secret</pass>
          </router>
          <local>
            <ip>0.0.0.0</ip>
            <port>5269</port>
            <id realm="realm-a">a.example</id>
          </local>
        </s2s>
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.id, "s2s.example");
        assert_eq!(config.router.ip, "127.0.0.1");
        assert_eq!(config.router.port, 5347);
        assert_eq!(config.router.retry_init, 3);
        assert_eq!(config.check.interval, Duration::from_secs(60));
        assert_eq!(config.lookup.min_ttl, Duration::from_secs(60));
        assert!(!config.out_conn_reuse);
        assert!(matches!(config.log_sink, LogSink::Stdout));
        let domain = crate::domain::Domain::new("a.example").unwrap();
        assert!(config.hosts.is_local(&domain));
        assert_eq!(config.hosts.get(&domain).unwrap().realm, "realm-a");
    }

    #[test]
    fn missing_required_field_is_a_config_error() {
        let xml = r#"<s2s><id>s2s.example</id></s2s>"#;
        assert!(Config::from_str(xml).is_err());
    }

    #[test]
    fn overrides_check_section_values() {
        let xml = r#"
            <s2s>
              <id>s2s.example</id>
              <router><ip>127.0.0.1</ip><port>5347</port><user>s2s</user><pass>x</pass></router>
              <local><ip>0.0.0.0</ip><port>5269</port><id>a.example</id></local>
              <check><interval>30</interval><idle>10</idle></check>
              <out-conn-reuse/>
            </s2s>
        "#;
        let config = Config::from_str(xml).unwrap();
        assert_eq!(config.check.interval, Duration::from_secs(30));
        assert_eq!(config.check.idle, Duration::from_secs(10));
        assert_eq!(config.check.queue, Duration::from_secs(60));
        assert!(config.out_conn_reuse);
    }

    #[test]
    fn syslog_sink_reads_facility_and_ident() {
        let xml = r#"
            <s2s>
              <id>s2s.example</id>
              <router><ip>127.0.0.1</ip><port>5347</port><user>s2s</user><pass>x</pass></router>
              <local><ip>0.0.0.0</ip><port>5269</port><id>a.example</id></local>
              <log type="syslog"><facility>local0</facility><ident>s2sd</ident></log>
            </s2s>
        "#;
        let config = Config::from_str(xml).unwrap();
        match config.log_sink {
            LogSink::Syslog { facility, ident } => {
                assert_eq!(facility, "local0");
                assert_eq!(ident, "s2sd");
            }
            _ => panic!("expected syslog sink"),
        }
    }
}
