//! bridgeme CLI
//!
//! Provides the `bridgeme` binary: `host` shares the local shell through a
//! relay, `connect` attaches to it, and `status` / `close` talk to a running
//! host process over its loopback control endpoint.

pub mod commands;
pub mod control;
pub mod output;
