use serde::{Deserialize, Serialize};

/// Config document for v2ray-compatible engines (v2fly, xray).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct V2rayConfig {
    pub log: LogConfig,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogConfig {
    pub access: String,
    pub error: String,
    pub loglevel: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    pub sniffing: Sniffing,
    pub listen: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InboundSettings {
    pub udp: bool,
    pub auth: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_settings: Option<ProxySettings>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamSettings {
    pub sockopt: SockOpt,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SockOpt {
    pub mark: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxySettings {
    pub tag: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub inbound_tag: Vec<String>,
    pub outbound_tag: String,
}

pub const SOCKS_INBOUND_TAG: &str = "socks-in";
pub const PROXY_OUTBOUND_TAG: &str = "proxy";
const PRE_SOCKS_TAG: &str = "pre-socks";

impl V2rayConfig {
    pub fn new(loglevel: &str) -> Self {
        Self {
            log: LogConfig {
                access: String::new(),
                error: String::new(),
                loglevel: loglevel.to_string(),
            },
            inbounds: vec![],
            outbounds: vec![],
            routing: Routing {
                domain_strategy: "AsIs".to_string(),
                rules: vec![],
            },
        }
    }

    /// The config launched for single-port engines: one local socks inbound
    /// routed straight to a freedom outbound. A non-zero `pre_socks_port`
    /// chains that outbound through a local socks server.
    pub fn single_port(port: u16, pre_socks_port: u16, loglevel: &str) -> Self {
        let mut cfg = Self::new(loglevel)
            .with_socks_inbound(SOCKS_INBOUND_TAG, port)
            .with_freedom_outbound(PROXY_OUTBOUND_TAG)
            .with_route(SOCKS_INBOUND_TAG, PROXY_OUTBOUND_TAG);
        if pre_socks_port != 0 {
            cfg = cfg.with_pre_socks(PROXY_OUTBOUND_TAG, pre_socks_port);
        }
        cfg
    }

    pub fn with_socks_inbound(mut self, tag: &str, port: u16) -> Self {
        self.inbounds.push(Inbound {
            tag: tag.to_string(),
            port,
            protocol: "socks".to_string(),
            settings: InboundSettings {
                udp: true,
                auth: "noauth".to_string(),
            },
            sniffing: Sniffing {
                enabled: true,
                dest_override: vec!["http".to_string(), "tls".to_string()],
            },
            listen: "127.0.0.1".to_string(),
        });
        self
    }

    pub fn with_freedom_outbound(mut self, tag: &str) -> Self {
        self.outbounds.push(Outbound {
            tag: tag.to_string(),
            protocol: "freedom".to_string(),
            settings: None,
            stream_settings: Some(StreamSettings {
                sockopt: SockOpt { mark: 255 },
            }),
            proxy_settings: None,
        });
        self
    }

    pub fn with_route(mut self, inbound_tag: &str, outbound_tag: &str) -> Self {
        self.routing.rules.push(RoutingRule {
            rule_type: "field".to_string(),
            inbound_tag: vec![inbound_tag.to_string()],
            outbound_tag: outbound_tag.to_string(),
        });
        self
    }

    fn with_pre_socks(mut self, outbound_tag: &str, port: u16) -> Self {
        if let Some(outbound) = self.outbounds.iter_mut().find(|o| o.tag == outbound_tag) {
            outbound.proxy_settings = Some(ProxySettings {
                tag: PRE_SOCKS_TAG.to_string(),
            });
        }
        self.outbounds.push(Outbound {
            tag: PRE_SOCKS_TAG.to_string(),
            protocol: "socks".to_string(),
            settings: Some(serde_json::json!({
                "servers": [{ "address": "127.0.0.1", "port": port }]
            })),
            stream_settings: None,
            proxy_settings: None,
        });
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
