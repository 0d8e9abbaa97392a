use serde::{Deserialize, Serialize};
use std::fmt;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    V2fly,
    #[default]
    Xray,
    Clash,
    ClashMeta,
    Custom,
}

impl CoreType {
    pub fn is_clash_family(self) -> bool {
        matches!(self, CoreType::Clash | CoreType::ClashMeta)
    }
}

impl fmt::Display for CoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoreType::V2fly => "v2fly",
            CoreType::Xray => "xray",
            CoreType::Clash => "clash",
            CoreType::ClashMeta => "clash_meta",
            CoreType::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "v2fly" | "v2ray" => Ok(CoreType::V2fly),
            "xray" => Ok(CoreType::Xray),
            "clash" => Ok(CoreType::Clash),
            "clash_meta" | "clashmeta" | "mihomo" => Ok(CoreType::ClashMeta),
            "custom" => Ok(CoreType::Custom),
            other => Err(format!("unknown core type: {}", other)),
        }
    }
}

/// Where a profile's config file came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// A file the user supplied and that is passed to the engine untouched.
    #[default]
    Custom,
    /// A Clash proxy list that goes through the converter before launch.
    ConvertedYaml,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Http,
    Socks,
    #[default]
    Mixed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListenerPort {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub protocol_type: ProtocolType,
    pub port: u16,
    /// Upstream proxy or group this listener routes to, "global" when unbound.
    #[serde(rename = "proxy", default = "default_bound_proxy")]
    pub bound_proxy_name: String,
    #[serde(default)]
    pub is_active: bool,
}

fn default_bound_proxy() -> String {
    "global".to_string()
}

impl ListenerPort {
    pub fn new(name: &str, protocol_type: ProtocolType, port: u16, proxy: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol_type,
            port,
            bound_proxy_name: proxy.to_string(),
            is_active: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileItem {
    #[serde(rename = "indexId", default)]
    pub id: String,
    #[serde(rename = "remarks", default)]
    pub display_name: String,
    #[serde(rename = "address", default)]
    pub config_path: String,
    #[serde(rename = "coreType", default)]
    pub core_type: CoreType,
    #[serde(rename = "configType", default)]
    pub config_kind: ConfigKind,
    #[serde(rename = "port", default)]
    pub primary_port: u16,
    // 0 means no upstream socks hop.
    #[serde(rename = "preSocksPort", default)]
    pub pre_socks_port: u16,
    #[serde(rename = "displayLog", default = "default_true")]
    pub display_log: bool,
    #[serde(rename = "isRunning", default)]
    pub is_running: bool,
    #[serde(rename = "clashProxyPorts", default)]
    pub listeners: Vec<ListenerPort>,
}

impl Default for ProfileItem {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            config_path: String::new(),
            core_type: CoreType::default(),
            config_kind: ConfigKind::default(),
            primary_port: 0,
            pre_socks_port: 0,
            display_log: true,
            is_running: false,
            listeners: vec![],
        }
    }
}

impl ProfileItem {
    pub fn new(display_name: &str, core_type: CoreType, config_path: &str, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            config_path: config_path.to_string(),
            core_type,
            primary_port: port,
            ..Self::default()
        }
    }

    /// Ports the supervisor should expect the engine to open.
    pub fn declared_ports(&self) -> Vec<u16> {
        if self.core_type.is_clash_family() && !self.listeners.is_empty() {
            let mut ports = Vec::with_capacity(self.listeners.len());
            for listener in &self.listeners {
                if !ports.contains(&listener.port) {
                    ports.push(listener.port);
                }
            }
            ports
        } else if self.primary_port != 0 {
            vec![self.primary_port]
        } else {
            self.listeners.iter().map(|l| l.port).collect()
        }
    }

    pub fn clear_runtime_flags(&mut self) {
        self.is_running = false;
        for listener in &mut self.listeners {
            listener.is_active = false;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub profile_items: Vec<ProfileItem>,
    #[serde(default)]
    pub selected_profile_id: String,
}

impl Config {
    pub fn find(&self, id: &str) -> Option<&ProfileItem> {
        self.profile_items.iter().find(|p| p.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut ProfileItem> {
        self.profile_items.iter_mut().find(|p| p.id == id)
    }

    pub fn selected(&self) -> Option<&ProfileItem> {
        if self.selected_profile_id.is_empty() {
            return None;
        }
        self.find(&self.selected_profile_id)
    }
}
