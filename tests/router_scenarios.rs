//! End-to-end coverage for the config → router wiring, exercising the
//! concrete scenarios from the design spec (S1-S3) without needing a real
//! Salesforce org, broker, or Redis instance: everything downstream of
//! config loading is pure/local once a [`rabbit_force::router::Router`] is
//! built.

use rabbit_force::config::load_config_from_path;
use rabbit_force::envelope::Envelope;
use rabbit_force::router::Router;
use serde_json::json;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// S1: one org, one broker, no rules, default route only. Expect the
/// default route to be picked for a lead-change event and the replay
/// marker to be extractable from it.
#[test]
fn s1_default_route_picked_when_no_rules_configured() {
    let file = write_config(
        r#"{
        "source": {"orgs": {"my_org": {
            "consumer_key": "k", "consumer_secret": "s", "username": "u", "password": "p",
            "resources": [{"type": "PushTopic", "spec": {"Name": "lead_changes"}}]
        }}},
        "sink": {"brokers": {"my_broker": {
            "host": "localhost", "login": "guest", "password": "guest",
            "exchanges": [{"exchange_name": "my_exchange", "type": "fanout"}]
        }}},
        "router": {"default_route": {"broker_name": "my_broker", "exchange_name": "my_exchange", "routing_key": "event_message"}}
    }"#,
    );
    let config = load_config_from_path(file.path()).unwrap();
    let router = Router::new(&config.router, &config.brokers).unwrap();

    let envelope = Envelope::new(
        "my_org",
        json!({
            "channel": "/topic/lead_changes",
            "data": {"event": {"replayId": 42, "createdDate": "2026-01-01T00:00:00.000Z"}}
        }),
    );
    let route = router.route(&envelope).unwrap();
    assert_eq!(route.routing_key, "event_message");
    assert_eq!(envelope.event_marker().unwrap().replay_id, 42);
}

/// S2: rules for `created`/`updated`, no default. A `deleted` event
/// matches neither rule and is dropped, even though it still carries a
/// replay id that must be persisted regardless of routing outcome.
#[test]
fn s2_unmatched_event_drops_but_replay_id_is_independent_of_routing() {
    let file = write_config(
        r#"{
        "source": {"orgs": {"my_org": {"consumer_key": "k", "consumer_secret": "s", "username": "u", "password": "p"}}},
        "sink": {"brokers": {"b": {"host": "localhost", "login": "g", "password": "g",
            "exchanges": [{"exchange_name": "x", "type": "topic"}]}}},
        "router": {
            "rules": [
                {"condition": "$[?(@.message.data.event.type='created')]", "route": {"broker_name": "b", "exchange_name": "x", "routing_key": "lead.create"}},
                {"condition": "$[?(@.message.data.event.type='updated')]", "route": {"broker_name": "b", "exchange_name": "x", "routing_key": "lead.update"}}
            ]
        }
    }"#,
    );
    let config = load_config_from_path(file.path()).unwrap();
    let router = Router::new(&config.router, &config.brokers).unwrap();

    let deleted = Envelope::new(
        "my_org",
        json!({"channel": "/topic/lead_changes", "data": {"event": {"type": "deleted", "replayId": 7, "createdDate": "x"}}}),
    );
    assert!(router.route(&deleted).is_none());
    assert_eq!(deleted.event_marker().unwrap().replay_id, 7);

    let created = Envelope::new(
        "my_org",
        json!({"channel": "/topic/lead_changes", "data": {"event": {"type": "created", "replayId": 8, "createdDate": "x"}}}),
    );
    assert_eq!(router.route(&created).unwrap().routing_key, "lead.create");
}

/// S3: two orgs, a rule keyed on `org_name`, and a default for the other
/// org. Each org's envelope should resolve to a distinct routing key.
#[test]
fn s3_rule_on_org_name_distinguishes_two_orgs() {
    let file = write_config(
        r#"{
        "source": {"orgs": {
            "org1": {"consumer_key": "k", "consumer_secret": "s", "username": "u", "password": "p"},
            "org2": {"consumer_key": "k", "consumer_secret": "s", "username": "u", "password": "p"}
        }},
        "sink": {"brokers": {"b": {"host": "localhost", "login": "g", "password": "g",
            "exchanges": [{"exchange_name": "x", "type": "topic"}]}}},
        "router": {
            "default_route": {"broker_name": "b", "exchange_name": "x", "routing_key": "org2_message"},
            "rules": [{"condition": "$[?(@.org_name='org1')]", "route": {"broker_name": "b", "exchange_name": "x", "routing_key": "org1_message"}}]
        }
    }"#,
    );
    let config = load_config_from_path(file.path()).unwrap();
    let router = Router::new(&config.router, &config.brokers).unwrap();

    let e1 = Envelope::new("org1", json!({"channel": "/topic/a"}));
    let e2 = Envelope::new("org2", json!({"channel": "/topic/a"}));
    assert_eq!(router.route(&e1).unwrap().routing_key, "org1_message");
    assert_eq!(router.route(&e2).unwrap().routing_key, "org2_message");
}

/// S4 (partial, startup-validation half): a route referencing a broker or
/// exchange that was never declared under `sink.brokers` must fail
/// `Router::new` (§3 invariant iii) — there is no way to reach a CometD
/// handshake past this point because the Pipeline builds the Router before
/// the Source Manager (§4.H startup order).
#[test]
fn startup_validation_rejects_config_with_dangling_route_reference() {
    let file = write_config(
        r#"{
        "source": {"orgs": {"my_org": {"consumer_key": "k", "consumer_secret": "s", "username": "u", "password": "p"}}},
        "sink": {"brokers": {"my_broker": {"host": "localhost", "login": "g", "password": "g",
            "exchanges": [{"exchange_name": "real_exchange", "type": "fanout"}]}}},
        "router": {"default_route": {"broker_name": "my_broker", "exchange_name": "typo_exchange", "routing_key": "k"}}
    }"#,
    );
    let config = load_config_from_path(file.path()).unwrap();
    assert!(Router::new(&config.router, &config.brokers).is_err());
}
