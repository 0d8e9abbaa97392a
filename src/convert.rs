//! Clash proxy-list conversion.
//!
//! Turns a Clash-style document into one where every named proxy gets its own
//! `mixed` listener on a consecutive port, all proxies are collected in a
//! single `select` group, and DNS runs in fake-ip mode.

use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::ConvertError;
use crate::profile::{ListenerPort, ProtocolType};

pub const SELECT_GROUP_NAME: &str = "Line Selection";
const DEFAULT_NAMESERVER: &str = "223.5.5.5";
const DOH_NAMESERVER: &str = "https://doh.pub/dns-query";
const FAKE_IP_RANGE: &str = "198.18.0.1/16";

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ConvertedConfig {
    allow_lan: bool,
    dns: DnsSection,
    listeners: Vec<ClashListener>,
    proxies: Vec<Value>,
    proxy_groups: Vec<ProxyGroup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct DnsSection {
    enable: bool,
    enhanced_mode: String,
    fake_ip_range: String,
    default_nameserver: Vec<String>,
    nameserver: Vec<String>,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            enable: true,
            enhanced_mode: "fake-ip".to_string(),
            fake_ip_range: FAKE_IP_RANGE.to_string(),
            default_nameserver: vec![DEFAULT_NAMESERVER.to_string()],
            nameserver: vec![DOH_NAMESERVER.to_string()],
        }
    }
}

#[derive(Debug, Serialize)]
struct ClashListener {
    name: String,
    #[serde(rename = "type")]
    listener_type: String,
    port: u16,
    proxy: String,
}

#[derive(Debug, Serialize)]
struct ProxyGroup {
    name: String,
    #[serde(rename = "type")]
    group_type: String,
    proxies: Vec<String>,
}

/// Result of a successful conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub listeners: Vec<ListenerPort>,
    /// Sanitized proxy names in source order.
    pub proxy_names: Vec<String>,
    /// The rendered YAML document.
    pub document: String,
}

fn emoji_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"\\[Uu]\{?[0-9A-Fa-f]{4,8}\}?",
            r"|[\x{1F1E6}-\x{1F1FF}\x{1F000}-\x{1FAFF}\x{2600}-\x{27BF}\x{2B00}-\x{2BFF}",
            r"\x{FE00}-\x{FE0F}\x{200D}\x{20E3}\x{E0020}-\x{E007F}]",
        ))
        .expect("emoji pattern is valid")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Strips flag/pictographic emoji and escaped code points, then collapses
/// whitespace. Falls back to the trimmed input if nothing printable remains.
pub fn sanitize_proxy_name(raw: &str) -> String {
    let stripped = emoji_re().replace_all(raw, " ");
    let collapsed = whitespace_re().replace_all(&stripped, " ");
    let cleaned = collapsed.trim();
    if cleaned.is_empty() {
        raw.trim().to_string()
    } else {
        cleaned.to_string()
    }
}

fn scalar_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Converts a Clash document held in memory. Pure: no I/O.
pub fn convert_document(source: &str, start_port: u16) -> Result<Conversion, ConvertError> {
    let root: Value = serde_yaml::from_str(source)?;
    let proxies = root
        .get("proxies")
        .and_then(Value::as_sequence)
        .ok_or(ConvertError::MissingProxies)?;

    let mut out_proxies = Vec::with_capacity(proxies.len());
    let mut listeners = Vec::new();
    let mut names = Vec::new();
    let mut used = HashSet::new();

    for entry in proxies {
        let mut entry = entry.clone();
        let raw_name = entry.get("name").and_then(scalar_name);

        if let Some(raw_name) = raw_name {
            let name = unique_name(sanitize_proxy_name(&raw_name), &mut used);
            if let Value::Mapping(map) = &mut entry {
                map.insert(Value::from("name"), Value::from(name.clone()));
            }

            let index = listeners.len();
            let port = u16::try_from(start_port as usize + index)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(ConvertError::PortRange {
                    start: start_port,
                    index,
                })?;
            listeners.push(ClashListener {
                name: format!("mixed{}", index),
                listener_type: "mixed".to_string(),
                port,
                proxy: name.clone(),
            });
            names.push(name);
        } else {
            debug!("Proxy entry without a name, no listener generated");
        }
        out_proxies.push(entry);
    }

    let converted = ConvertedConfig {
        allow_lan: true,
        dns: DnsSection::default(),
        listeners,
        proxies: out_proxies,
        proxy_groups: vec![ProxyGroup {
            name: SELECT_GROUP_NAME.to_string(),
            group_type: "select".to_string(),
            proxies: names.clone(),
        }],
    };
    let document = serde_yaml::to_string(&converted)?;

    Ok(Conversion {
        listeners: converted
            .listeners
            .iter()
            .map(|l| ListenerPort::new(&l.name, ProtocolType::Mixed, l.port, &l.proxy))
            .collect(),
        proxy_names: names,
        document,
    })
}

/// Converts `src` into `dst`.
///
/// On failure `dst` receives a verbatim copy of `src` and the error is
/// returned, so launch code always finds a file at `dst`.
pub fn convert_file(src: &Path, dst: &Path, start_port: u16) -> Result<Conversion, ConvertError> {
    let result = fs::read_to_string(src)
        .map_err(|source| ConvertError::Io {
            path: src.to_path_buf(),
            source,
        })
        .and_then(|text| convert_document(&text, start_port))
        .and_then(|conversion| {
            ensure_parent(dst)?;
            fs::write(dst, &conversion.document).map_err(|source| ConvertError::Io {
                path: dst.to_path_buf(),
                source,
            })?;
            Ok(conversion)
        });

    match result {
        Ok(conversion) => {
            info!(
                "Converted {:?} -> {:?} ({} listeners from port {})",
                src,
                dst,
                conversion.listeners.len(),
                start_port
            );
            Ok(conversion)
        }
        Err(e) => {
            warn!("Conversion of {:?} failed, copying verbatim: {}", src, e);
            if let Err(copy_err) = copy_verbatim(src, dst) {
                warn!("Fallback copy to {:?} failed: {}", dst, copy_err);
            }
            Err(e)
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConvertError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| ConvertError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

fn copy_verbatim(src: &Path, dst: &Path) -> Result<(), ConvertError> {
    let same_file = match (fs::canonicalize(src), fs::canonicalize(dst)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same_file {
        return Ok(());
    }
    ensure_parent(dst)?;
    fs::copy(src, dst).map_err(|source| ConvertError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// How a port was found in a raw Clash config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOrigin {
    /// Read from the parsed YAML tree.
    Structural,
    /// Scraped from text by pattern after structural parsing found nothing.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPort {
    pub name: String,
    pub protocol: ProtocolType,
    pub port: u16,
    pub proxy: String,
    pub origin: PortOrigin,
}

impl DiscoveredPort {
    pub fn to_listener(&self) -> ListenerPort {
        ListenerPort::new(&self.name, self.protocol, self.port, &self.proxy)
    }
}

const TOP_LEVEL_PORT_KEYS: [(&str, ProtocolType); 3] = [
    ("mixed-port", ProtocolType::Mixed),
    ("port", ProtocolType::Http),
    ("socks-port", ProtocolType::Socks),
];

fn port_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    port.filter(|p| *p != 0)
}

fn protocol_of(kind: &str) -> ProtocolType {
    match kind.to_ascii_lowercase().as_str() {
        "mixed" => ProtocolType::Mixed,
        "http" => ProtocolType::Http,
        "socks" | "socks5" => ProtocolType::Socks,
        _ => ProtocolType::Other,
    }
}

fn discover_structural(root: &Value) -> Vec<DiscoveredPort> {
    let mut found = Vec::new();
    for (key, protocol) in TOP_LEVEL_PORT_KEYS {
        if let Some(port) = root.get(key).and_then(port_value) {
            found.push(DiscoveredPort {
                name: key.to_string(),
                protocol,
                port,
                proxy: "global".to_string(),
                origin: PortOrigin::Structural,
            });
        }
    }

    let listeners = root.get("listeners").and_then(Value::as_sequence);
    for (index, listener) in listeners.into_iter().flatten().enumerate() {
        let Some(port) = listener.get("port").and_then(port_value) else {
            continue;
        };
        let name = listener
            .get("name")
            .and_then(scalar_name)
            .unwrap_or_else(|| format!("listener{}", index));
        let protocol = listener
            .get("type")
            .and_then(Value::as_str)
            .map(protocol_of)
            .unwrap_or(ProtocolType::Other);
        let proxy = listener
            .get("proxy")
            .and_then(scalar_name)
            .unwrap_or_else(|| "global".to_string());
        found.push(DiscoveredPort {
            name,
            protocol,
            port,
            proxy,
            origin: PortOrigin::Structural,
        });
    }
    found
}

fn port_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^(mixed-port|socks-port|port)\s*:\s*["']?(\d{1,5})"#)
            .expect("port line pattern is valid")
    })
}

fn discover_heuristic(text: &str) -> Vec<DiscoveredPort> {
    let mut found: Vec<DiscoveredPort> = Vec::new();
    for caps in port_line_re().captures_iter(text) {
        let key = &caps[1];
        let Some(port) = caps[2].parse::<u16>().ok().filter(|p| *p != 0) else {
            continue;
        };
        if found.iter().any(|d| d.name == key) {
            continue;
        }
        let protocol = TOP_LEVEL_PORT_KEYS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, p)| *p)
            .unwrap_or(ProtocolType::Other);
        found.push(DiscoveredPort {
            name: key.to_string(),
            protocol,
            port,
            proxy: "global".to_string(),
            origin: PortOrigin::Heuristic,
        });
    }
    found
}

/// Finds the ports a raw Clash config will listen on. The YAML tree is
/// consulted first; the line scan only runs when that yields nothing.
pub fn discover_ports(text: &str) -> Vec<DiscoveredPort> {
    match serde_yaml::from_str::<Value>(text) {
        Ok(root) => {
            let found = discover_structural(&root);
            if !found.is_empty() {
                return found;
            }
            debug!("No ports in parsed config, scanning text");
        }
        Err(e) => debug!("Config is not valid yaml ({}), scanning text", e),
    }
    discover_heuristic(text)
}
