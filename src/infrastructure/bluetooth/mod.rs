//! Bluetooth Module
//!
//! BLE client engine for the voice recorder.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    RecorderService                       │
//! │  (Main coordinator - public API for the application)     │
//! └──────┬──────────────┬──────────────┬───────────────┬─────┘
//!        │              │              │               │
//!        ▼              ▼              ▼               ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌────────────┐
//! │  Scanner  │  │ Connection │  │  Session  │  │  Transfer  │
//! │           │  │            │  │           │  │            │
//! │ - picker  │  │ - state    │  │ - init    │  │ - catalog  │
//! │ - registry│  │ - notify   │  │ - commands│  │ - chunks   │
//! └─────┬─────┘  └─────┬──────┘  └─────┬─────┘  └────────────┘
//!       │              │               │
//!       ▼              ▼               ▼
//! ┌──────────────────────────┐  ┌─────────────────────────┐
//! │   Link / DevicePicker    │  │  Protocol / Responses   │
//! │  (WinRT, Mock)           │  │  (frame codec)          │
//! └──────────────────────────┘  └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Command ids and command encoding
//! - [`responses`] - Response decoding
//! - [`link`] - Transport traits implemented by the platform backends
//! - [`connection`] - Connection state machine and notification fan-out
//! - [`session`] - Post-connect initialization and device commands
//! - [`transfer`] - Recording catalog and file download reassembly
//! - [`scanner`] - Device discovery
//! - [`service`] - Main service coordinator
//! - [`mock`] - In-memory backend and scripted recorder

pub mod connection;
pub mod link;
pub mod mock;
pub mod protocol;
pub mod responses;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transfer;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::RecorderService;
