//! Local control endpoint used by `bridgeme status` and `bridgeme close`

mod server;

pub use server::ControlServer;
