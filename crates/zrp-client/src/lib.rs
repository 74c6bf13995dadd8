//! zrp-client: dials a zrp server and exposes local TCP services through it.

pub mod config;
pub mod controller;
pub mod share;
pub mod worker;

pub use config::ClientConfig;
pub use controller::Controller;
