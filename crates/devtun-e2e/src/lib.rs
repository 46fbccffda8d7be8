//! End-to-end test utilities for the devtun agent
//!
//! This crate runs the real tunnel manager against an in-process access
//! point and in-memory collaborators, so tests need neither ADB nor the
//! control plane.

pub mod access_point;
pub mod harness;
pub mod local_service;
pub mod mocks;

pub use access_point::{MockAccessPoint, RecordedHandshake, TUNNEL_PROTOCOL};
pub use harness::{wait_until, TestAgent, CLIENT_ID};
pub use local_service::{LocalService, ServiceMode};
pub use mocks::{channel_feed, ChannelFeed, IssuedToken, MockDirectory, MockIdentityResolver};
