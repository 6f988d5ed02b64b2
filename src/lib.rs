//! Pure Rust async client for the [Source RCON protocol](https://developer.valvesoftware.com/wiki/Source_RCON_Protocol),
//! as spoken by srcds and Minecraft servers.
//!
//! A single [client::Client] keeps one connection open and shares it between
//! any number of tasks. A background task reads every answer the server
//! sends, and each request waits for the answer carrying its own packet id.
//! Lost connections are reopened (and logged into again) on the next request.
pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod packet;
pub mod reader;
pub mod server;
