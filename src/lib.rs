//! boneIO controller core.
//!
//! Binds locally attached I/O (GPIO inputs, relays on GPIO or I2C expanders,
//! Modbus-RTU devices, I2C/1-wire sensors) to logical entities published over
//! MQTT with Home Assistant auto-discovery. The crate is a library plus the
//! `boneio` binary; everything testable lives here.

pub mod config;
pub mod cover;
pub mod error;
pub mod hardware;
pub mod input;
pub mod manager;
pub mod modbus;
pub mod models;
pub mod net;
pub mod relay;
pub mod runtime;
pub mod sensor;
pub mod state;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Payload published on `<prefix>/state` while the process is up.
pub const ONLINE: &str = "online";
/// Last-will payload and graceful-shutdown payload for `<prefix>/state`.
pub const OFFLINE: &str = "offline";
