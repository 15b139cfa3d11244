//! Inbound chat event socket

pub mod protocol;
pub mod server;

pub use server::IpcServer;
