//! Notebook Hub - hosts many notebooks behind one set of ports
//!
//! This library provides:
//! - A durable notebook registry that publishes every mutation to subscribers
//! - A runner that keeps one notebook server process per registered notebook
//! - A reverse proxy that routes HTTP and WebSocket traffic by Host header
//! - A REST management API over the registry

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod notebook;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod runner;
pub mod websocket;
