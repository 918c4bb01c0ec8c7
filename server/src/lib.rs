//! Huddle realtime server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod broadcasts;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod presence;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod ws;
