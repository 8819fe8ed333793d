//! Tenantgate - subdomain router and realtime build-log gateway
//!
//! Two processes share this library:
//! - The router resolves a tenant slug from the Host header and serves that
//!   tenant's static artifact from an object-store origin, with index fallback
//! - The gateway accepts build submissions, hands them to an external task
//!   scheduler, and relays build logs from a pub/sub bus to WebSocket clients
//!   subscribed to the project's room

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod keepalive;
pub mod realtime;
pub mod relay;
pub mod rooms;
pub mod router;
pub mod routing;
pub mod scheduler;
pub mod slug;
pub mod topic;
pub mod upstream;
