//! Client side of the loopback control endpoint
//!
//! One JSON object per line over TCP on 127.0.0.1, see [`bm_core::ipc`].

mod client;

pub use client::ControlClient;
