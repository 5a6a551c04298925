//! goldenbridge - a WebSocket bridge for the TurboGOLDEN legacy host.
//!
//! TurboGOLDEN is a character-mode application reachable only through a raw
//! telnet-style byte stream with a fixed multi-step login. Modern clients
//! (xterm.js in a browser) speak discrete messages, not streams. This crate
//! sits between the two: it owns the TCP connection to the host, drives the
//! login handshake, and then relays bytes in both directions, turning host
//! output into framed JSON events and client input events back into raw
//! writes. One proxied session per connected WebSocket client.

pub mod api;
pub mod config;
pub mod handshake;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod telnet;
