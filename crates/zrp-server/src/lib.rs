//! zrp-server: accepts client and worker connections, brokers visitors to
//! the tcp shares clients have announced.

pub mod config;
pub mod controller;
pub mod hello;
pub mod server;
pub mod share;
pub mod worker;

pub use config::ServerConfig;
pub use server::Server;
