//! TFTP (RFC 1350) server and client with RFC 2347/2348/2349 option
//! negotiation. Every transfer runs on its own ephemeral UDP socket in
//! lock-step stop-and-wait; all data moves in octet mode.

pub mod channel;
pub mod client;
pub mod options;
pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::TFTP_PORT;
pub use server::{ServerConfig, TftpServer};
