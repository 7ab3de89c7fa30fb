//! Configuration file loading (spec §6).
//!
//! JSON or YAML, dispatched by file extension. Mirrors the shape the
//! teacher's `forwarder::config` module uses for TOML: a `Raw*` struct
//! with every field `Option`, deserialized by serde, then validated into
//! a strict domain struct with defaults applied.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Domain types (spec §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub orgs: HashMap<String, OrgSpec>,
    pub replay: ReplayConfig,
    pub brokers: HashMap<String, BrokerSpec>,
    pub router: RouterConfig,
}

#[derive(Debug, Clone)]
pub struct OrgSpec {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub username: String,
    pub password: String,
    pub sandbox: bool,
    pub login_url: String,
    pub api_version: Option<String>,
    pub resources: Vec<ResourceSpec>,
}

#[derive(Debug, Clone)]
pub enum ResourceSpec {
    PushTopic { spec: serde_json::Map<String, serde_json::Value>, durable: bool },
    StreamingChannel { spec: serde_json::Map<String, serde_json::Value>, durable: bool },
}

impl ResourceSpec {
    pub fn durable(&self) -> bool {
        match self {
            ResourceSpec::PushTopic { durable, .. } => *durable,
            ResourceSpec::StreamingChannel { durable, .. } => *durable,
        }
    }

    pub fn spec(&self) -> &serde_json::Map<String, serde_json::Value> {
        match self {
            ResourceSpec::PushTopic { spec, .. } => spec,
            ResourceSpec::StreamingChannel { spec, .. } => spec,
        }
    }

    pub fn sobject_name(&self) -> &'static str {
        match self {
            ResourceSpec::PushTopic { .. } => "PushTopic",
            ResourceSpec::StreamingChannel { .. } => "StreamingChannel",
        }
    }

    /// True if `spec` already names an existing resource rather than one to
    /// be created (§3: `spec` contains *only* an `Id` or `Name` — for
    /// StreamingChannel the name must start with `/u/`). A spec carrying
    /// `Name` alongside creation fields like `Query`/`ApiVersion` is a
    /// to-be-created resource, not an existing one, even though it has a
    /// `Name` key.
    pub fn names_existing(&self) -> bool {
        let spec = self.spec();
        if spec.len() != 1 {
            return false;
        }
        if spec.contains_key("Id") {
            return true;
        }
        match spec.get("Name").and_then(|v| v.as_str()) {
            Some(name) => match self {
                ResourceSpec::PushTopic { .. } => true,
                ResourceSpec::StreamingChannel { .. } => name.starts_with("/u/"),
            },
            None => false,
        }
    }

    /// The Bayeux channel this resource is delivered on (§3): `/topic/{Name}`
    /// for PushTopic, the literal (already `/u/`-prefixed) `Name` for
    /// StreamingChannel.
    pub fn bayeux_channel(&self, resolved_name: &str) -> String {
        match self {
            ResourceSpec::PushTopic { .. } => format!("/topic/{resolved_name}"),
            ResourceSpec::StreamingChannel { .. } => resolved_name.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    pub address: Option<String>,
    pub key_prefix: String,
    pub additional_params: Option<serde_json::Value>,
    pub ignore_network_errors: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerSpec {
    pub host: String,
    pub port: Option<u16>,
    pub login: String,
    pub password: String,
    pub virtualhost: String,
    pub ssl: bool,
    pub verify_ssl: bool,
    pub login_method: Option<String>,
    pub insist: bool,
    pub exchanges: Vec<ExchangeSpec>,
}

#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub exchange_name: String,
    pub type_name: ExchangeType,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Fanout,
    Direct,
    Topic,
    Headers,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteProperties {
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
    pub headers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub broker_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub properties: Option<RouteProperties>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub condition: String,
    pub route: Route,
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub default_route: Option<Route>,
    pub rules: Vec<Rule>,
}

// ---------------------------------------------------------------------------
// Raw deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawRoot {
    source: RawSource,
    sink: RawSink,
    router: Option<RawRouterConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    orgs: HashMap<String, RawOrgSpec>,
    replay: Option<RawReplayConfig>,
}

#[derive(Debug, Deserialize)]
struct RawOrgSpec {
    consumer_key: String,
    consumer_secret: String,
    username: String,
    password: String,
    #[serde(default)]
    sandbox: bool,
    login_url: Option<String>,
    api_version: Option<String>,
    #[serde(default)]
    resources: Vec<RawResourceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
enum RawResourceSpec {
    PushTopic {
        spec: serde_json::Map<String, serde_json::Value>,
        #[serde(default = "default_true")]
        durable: bool,
    },
    StreamingChannel {
        spec: serde_json::Map<String, serde_json::Value>,
        #[serde(default = "default_true")]
        durable: bool,
    },
}

#[derive(Debug, Deserialize)]
struct RawReplayConfig {
    address: Option<String>,
    key_prefix: Option<String>,
    additional_params: Option<serde_json::Value>,
    #[serde(default)]
    ignore_network_errors: bool,
}

#[derive(Debug, Deserialize)]
struct RawSink {
    brokers: HashMap<String, RawBrokerSpec>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerSpec {
    host: String,
    port: Option<u16>,
    login: String,
    password: String,
    #[serde(default = "default_vhost")]
    virtualhost: String,
    #[serde(default)]
    ssl: bool,
    #[serde(default = "default_true")]
    verify_ssl: bool,
    login_method: Option<String>,
    #[serde(default)]
    insist: bool,
    #[serde(default)]
    exchanges: Vec<RawExchangeSpec>,
}

#[derive(Debug, Deserialize)]
struct RawExchangeSpec {
    exchange_name: String,
    #[serde(rename = "type")]
    type_name: ExchangeType,
    #[serde(default)]
    passive: bool,
    #[serde(default = "default_true")]
    durable: bool,
    #[serde(default)]
    auto_delete: bool,
    #[serde(default)]
    no_wait: bool,
    #[serde(default)]
    arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRouterConfig {
    default_route: Option<RawRoute>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    condition: String,
    route: RawRoute,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    broker_name: String,
    exchange_name: String,
    routing_key: String,
    properties: Option<RawRouteProperties>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRouteProperties {
    delivery_mode: Option<u8>,
    priority: Option<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    expiration: Option<String>,
    message_id: Option<String>,
    app_id: Option<String>,
    #[serde(default)]
    headers: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_vhost() -> String {
    "/".to_owned()
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{0}': {1}")]
    Io(String, std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(String),
    #[error("unsupported config file extension: {0} (expected .json, .yaml or .yml)")]
    UnsupportedExtension(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load config from a path, dispatching on its extension (§6).
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let raw: RawRoot = match ext.as_str() {
        "json" => serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?,
        "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?,
        other => return Err(ConfigError::UnsupportedExtension(other.to_owned())),
    };
    validate(raw)
}

fn validate(raw: RawRoot) -> Result<Config, ConfigError> {
    let mut orgs = HashMap::with_capacity(raw.source.orgs.len());
    for (name, o) in raw.source.orgs {
        let login_url = o.login_url.unwrap_or_else(|| {
            if o.sandbox {
                "https://test.salesforce.com".to_owned()
            } else {
                "https://login.salesforce.com".to_owned()
            }
        });
        let resources = o
            .resources
            .into_iter()
            .map(|r| match r {
                RawResourceSpec::PushTopic { spec, durable } => ResourceSpec::PushTopic { spec, durable },
                RawResourceSpec::StreamingChannel { spec, durable } => {
                    ResourceSpec::StreamingChannel { spec, durable }
                }
            })
            .collect();
        orgs.insert(
            name,
            OrgSpec {
                consumer_key: o.consumer_key,
                consumer_secret: o.consumer_secret,
                username: o.username,
                password: o.password,
                sandbox: o.sandbox,
                login_url,
                api_version: o.api_version,
                resources,
            },
        );
    }

    let replay = match raw.source.replay {
        Some(r) => ReplayConfig {
            address: r.address,
            key_prefix: r.key_prefix.unwrap_or_else(|| "rabbit_force".to_owned()),
            additional_params: r.additional_params,
            ignore_network_errors: r.ignore_network_errors,
        },
        None => ReplayConfig {
            key_prefix: "rabbit_force".to_owned(),
            ..Default::default()
        },
    };

    let mut brokers = HashMap::with_capacity(raw.sink.brokers.len());
    for (name, b) in raw.sink.brokers {
        let exchanges = b
            .exchanges
            .into_iter()
            .map(|e| ExchangeSpec {
                exchange_name: e.exchange_name,
                type_name: e.type_name,
                passive: e.passive,
                durable: e.durable,
                auto_delete: e.auto_delete,
                no_wait: e.no_wait,
                arguments: e.arguments,
            })
            .collect();
        brokers.insert(
            name,
            BrokerSpec {
                host: b.host,
                port: b.port,
                login: b.login,
                password: b.password,
                virtualhost: b.virtualhost,
                ssl: b.ssl,
                verify_ssl: b.verify_ssl,
                login_method: b.login_method,
                insist: b.insist,
                exchanges,
            },
        );
    }

    let raw_router = raw.router.unwrap_or(RawRouterConfig { default_route: None, rules: vec![] });
    let default_route = raw_router.default_route.map(convert_route);
    let rules = raw_router
        .rules
        .into_iter()
        .map(|r| Rule { condition: r.condition, route: convert_route(r.route) })
        .collect();
    let router = RouterConfig { default_route, rules };

    if orgs.is_empty() {
        return Err(ConfigError::Invalid("source.orgs must declare at least one org".to_owned()));
    }
    if brokers.is_empty() {
        return Err(ConfigError::Invalid("sink.brokers must declare at least one broker".to_owned()));
    }

    Ok(Config { orgs, replay, brokers, router })
}

fn convert_route(r: RawRoute) -> Route {
    Route {
        broker_name: r.broker_name,
        exchange_name: r.exchange_name,
        routing_key: r.routing_key,
        properties: r.properties.map(|p| RouteProperties {
            delivery_mode: p.delivery_mode,
            priority: p.priority,
            correlation_id: p.correlation_id,
            reply_to: p.reply_to,
            expiration: p.expiration,
            message_id: p.message_id,
            app_id: p.app_id,
            headers: p.headers,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_CONFIG: &str = r#"
    {
        "source": {
            "orgs": {
                "my_org": {
                    "consumer_key": "k",
                    "consumer_secret": "s",
                    "username": "u",
                    "password": "p",
                    "resources": [
                        {"type": "PushTopic", "spec": {"Name": "lead_changes"}}
                    ]
                }
            }
        },
        "sink": {
            "brokers": {
                "my_broker": {
                    "host": "localhost",
                    "login": "guest",
                    "password": "guest",
                    "exchanges": [
                        {"exchange_name": "my_exchange", "type": "fanout"}
                    ]
                }
            }
        },
        "router": {
            "default_route": {"broker_name": "my_broker", "exchange_name": "my_exchange", "routing_key": "event_message"}
        }
    }
    "#;

    #[test]
    fn parses_minimal_json_config_with_defaults() {
        let raw: RawRoot = serde_json::from_str(JSON_CONFIG).unwrap();
        let cfg = validate(raw).unwrap();
        let org = &cfg.orgs["my_org"];
        assert_eq!(org.login_url, "https://login.salesforce.com");
        assert_eq!(cfg.replay.key_prefix, "rabbit_force");
        let broker = &cfg.brokers["my_broker"];
        assert_eq!(broker.virtualhost, "/");
        assert!(broker.verify_ssl);
        assert_eq!(cfg.router.default_route.as_ref().unwrap().routing_key, "event_message");
        assert!(org.resources[0].names_existing());
        assert_eq!(org.resources[0].bayeux_channel("lead_changes"), "/topic/lead_changes");
    }

    #[test]
    fn sandbox_org_defaults_to_test_login_url() {
        let mut raw: RawRoot = serde_json::from_str(JSON_CONFIG).unwrap();
        raw.source.orgs.get_mut("my_org").unwrap().sandbox = true;
        let cfg = validate(raw).unwrap();
        assert_eq!(cfg.orgs["my_org"].login_url, "https://test.salesforce.com");
    }

    #[test]
    fn yaml_and_json_parse_to_equivalent_configs() {
        let yaml = r#"
source:
  orgs:
    my_org:
      consumer_key: k
      consumer_secret: s
      username: u
      password: p
sink:
  brokers:
    my_broker:
      host: localhost
      login: guest
      password: guest
"#;
        let raw: RawRoot = serde_yaml::from_str(yaml).unwrap();
        let cfg = validate(raw).unwrap();
        assert_eq!(cfg.orgs["my_org"].username, "u");
        assert_eq!(cfg.brokers["my_broker"].host, "localhost");
    }

    #[test]
    fn streaming_channel_name_must_start_with_slash_u_to_count_as_existing() {
        let spec_existing: serde_json::Map<_, _> =
            serde_json::from_value(serde_json::json!({"Name": "/u/my_channel"})).unwrap();
        let spec_new: serde_json::Map<_, _> =
            serde_json::from_value(serde_json::json!({"Name": "my_channel"})).unwrap();
        let existing = ResourceSpec::StreamingChannel { spec: spec_existing, durable: true };
        let new = ResourceSpec::StreamingChannel { spec: spec_new, durable: true };
        assert!(existing.names_existing());
        assert!(!new.names_existing());
    }
}
