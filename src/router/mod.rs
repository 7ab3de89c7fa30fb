//! Rule Router (spec §4.F): evaluates an ordered list of rules against an
//! envelope and returns the first matching route, falling back to the
//! configured default route, or `None` if neither applies.

mod jsonpath;

use crate::config::{Route, RouterConfig};
use crate::envelope::Envelope;
use jsonpath::{JsonPath, ParseError};
use serde_json::json;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("rule condition '{condition}' failed to parse: {source}")]
    InvalidCondition { condition: String, source: ParseError },
    #[error("route references broker '{broker_name}' which is not declared under sink.brokers")]
    UnknownBroker { broker_name: String },
    #[error("route references exchange '{exchange_name}' on broker '{broker_name}' which is not declared")]
    UnknownExchange { broker_name: String, exchange_name: String },
}

struct CompiledRule {
    condition: JsonPath,
    route: Route,
}

/// Holds pre-parsed rule conditions so matching an envelope never re-parses
/// JSONPath on the hot path.
pub struct Router {
    rules: Vec<CompiledRule>,
    default_route: Option<Route>,
}

impl Router {
    /// Compiles every rule's condition and validates that each route (rule
    /// or default) references a broker/exchange pair actually declared
    /// under `sink.brokers` (§3 invariant iii). Run once at startup so a
    /// misconfigured route fails fast rather than silently dropping
    /// messages at runtime.
    pub fn new(
        config: &RouterConfig,
        brokers: &std::collections::HashMap<String, crate::config::BrokerSpec>,
    ) -> Result<Router, RouterError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            validate_route(&rule.route, brokers)?;
            let condition = JsonPath::parse(&rule.condition).map_err(|source| {
                RouterError::InvalidCondition { condition: rule.condition.clone(), source }
            })?;
            rules.push(CompiledRule { condition, route: rule.route.clone() });
        }
        if let Some(default_route) = &config.default_route {
            validate_route(default_route, brokers)?;
        }
        Ok(Router { rules, default_route: config.default_route.clone() })
    }

    /// First-match-wins over the ordered rule list; falls back to the
    /// default route; `None` means the envelope is dropped (§4.F).
    pub fn route(&self, envelope: &Envelope) -> Option<&Route> {
        let root = json!([{
            "org_name": envelope.org_name,
            "message": envelope.message,
        }]);
        for rule in &self.rules {
            if rule.condition.matches(&root) {
                trace!(org = %envelope.org_name, condition = ?rule.route.routing_key, "rule matched");
                return Some(&rule.route);
            }
        }
        self.default_route.as_ref()
    }
}

fn validate_route(
    route: &Route,
    brokers: &std::collections::HashMap<String, crate::config::BrokerSpec>,
) -> Result<(), RouterError> {
    let broker = brokers.get(&route.broker_name).ok_or_else(|| RouterError::UnknownBroker {
        broker_name: route.broker_name.clone(),
    })?;
    if !broker.exchanges.iter().any(|e| e.exchange_name == route.exchange_name) {
        return Err(RouterError::UnknownExchange {
            broker_name: route.broker_name.clone(),
            exchange_name: route.exchange_name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerSpec, ExchangeSpec, ExchangeType, Rule};
    use serde_json::json;
    use std::collections::HashMap;

    fn broker_with_exchange(name: &str) -> BrokerSpec {
        BrokerSpec {
            host: "localhost".into(),
            port: None,
            login: "guest".into(),
            password: "guest".into(),
            virtualhost: "/".into(),
            ssl: false,
            verify_ssl: true,
            login_method: None,
            insist: false,
            exchanges: vec![ExchangeSpec {
                exchange_name: name.into(),
                type_name: ExchangeType::Fanout,
                passive: false,
                durable: true,
                auto_delete: false,
                no_wait: false,
                arguments: Default::default(),
            }],
        }
    }

    fn route(broker_name: &str, exchange_name: &str, routing_key: &str) -> Route {
        Route {
            broker_name: broker_name.into(),
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            properties: None,
        }
    }

    #[test]
    fn first_matching_rule_wins_over_later_rules_and_default() {
        let mut brokers = HashMap::new();
        brokers.insert("b".to_owned(), broker_with_exchange("x"));
        let config = RouterConfig {
            default_route: Some(route("b", "x", "default_key")),
            rules: vec![
                Rule {
                    condition: "$[?(@.message.event='created')]".into(),
                    route: route("b", "x", "created_key"),
                },
                Rule {
                    condition: "$[?(@.org_name='org1')]".into(),
                    route: route("b", "x", "org1_key"),
                },
            ],
        };
        let router = Router::new(&config, &brokers).unwrap();

        let envelope = Envelope::new("org1", json!({"event": "created"}));
        let matched = router.route(&envelope).unwrap();
        assert_eq!(matched.routing_key, "created_key");
    }

    #[test]
    fn falls_back_to_default_route_when_no_rule_matches() {
        let mut brokers = HashMap::new();
        brokers.insert("b".to_owned(), broker_with_exchange("x"));
        let config = RouterConfig {
            default_route: Some(route("b", "x", "default_key")),
            rules: vec![Rule {
                condition: "$[?(@.message.event='created')]".into(),
                route: route("b", "x", "created_key"),
            }],
        };
        let router = Router::new(&config, &brokers).unwrap();
        let envelope = Envelope::new("org1", json!({"event": "deleted"}));
        assert_eq!(router.route(&envelope).unwrap().routing_key, "default_key");
    }

    #[test]
    fn no_match_and_no_default_drops_the_envelope() {
        let mut brokers = HashMap::new();
        brokers.insert("b".to_owned(), broker_with_exchange("x"));
        let config = RouterConfig {
            default_route: None,
            rules: vec![Rule {
                condition: "$[?(@.message.event='created')]".into(),
                route: route("b", "x", "created_key"),
            }],
        };
        let router = Router::new(&config, &brokers).unwrap();
        let envelope = Envelope::new("org1", json!({"event": "deleted"}));
        assert!(router.route(&envelope).is_none());
    }

    #[test]
    fn startup_validation_rejects_route_to_undeclared_exchange() {
        let mut brokers = HashMap::new();
        brokers.insert("b".to_owned(), broker_with_exchange("x"));
        let config = RouterConfig {
            default_route: Some(route("b", "not_declared", "k")),
            rules: vec![],
        };
        let err = Router::new(&config, &brokers).unwrap_err();
        assert!(matches!(err, RouterError::UnknownExchange { .. }));
    }

    #[test]
    fn startup_validation_rejects_route_to_undeclared_broker() {
        let brokers = HashMap::new();
        let config = RouterConfig { default_route: Some(route("missing", "x", "k")), rules: vec![] };
        let err = Router::new(&config, &brokers).unwrap_err();
        assert!(matches!(err, RouterError::UnknownBroker { .. }));
    }
}
