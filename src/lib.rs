//! Pincer - intercepting HTTP/HTTPS/WebSocket proxy engine
//!
//! Terminates TLS with certificates minted on the fly, lets an operator hold,
//! inspect and rewrite traffic, applies match & replace rules to everything
//! that passes through, and replays requests with substituted payloads.

pub mod app;
pub mod error;
pub mod http;
pub mod intruder;
pub mod proxy;
pub mod rules;
pub mod scope;

pub use app::{App, Config};
pub use error::*;
