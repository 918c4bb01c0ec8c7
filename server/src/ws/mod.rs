//! Realtime websocket layer: per-connection pumps, the hub that routes and
//! fans out messages, and the handlers for each inbound message type.

pub mod connection;
pub mod handler;
pub mod handlers;
pub mod hub;
pub mod protocol;
pub mod rate_limit;
pub mod subscriptions;
