//! Client engine for a BLE voice recorder: discovery, connection, device
//! commands and recording downloads.

pub mod domain;
pub mod infrastructure;
