//! `rabbit_force`: a durable, multi-tenant bridge from Salesforce's Streaming
//! API (CometD/Bayeux over long-poll HTTPS) to one or more RabbitMQ brokers.
//!
//! The binary entry point (`src/main.rs`) is a thin CLI shell; this library
//! crate holds every component named in the design: auth, provisioning,
//! the CometD client, the replay store, the router, the sink manager, and
//! the pipeline that binds them together.

pub mod auth;
pub mod backoff;
pub mod cli;
pub mod cometd;
pub mod config;
pub mod envelope;
pub mod error;
pub mod pipeline;
pub mod provisioner;
pub mod replay_store;
pub mod router;
pub mod sink_manager;
pub mod source_manager;
