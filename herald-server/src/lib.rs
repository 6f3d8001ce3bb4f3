//! # Herald Server
//!
//! Runs the herald orchestration engine against the campaign service's
//! infrastructure: lifecycle events and metadata change notifications over
//! Redis pub/sub, campaign records and referral counts from PostgreSQL, and
//! broadcast frames published to per-campaign Redis egress channels that the
//! WebSocket gateways fan out to clients.

pub mod infra;
