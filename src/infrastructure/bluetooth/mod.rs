//! Bluetooth Module
//!
//! Runs the managed devices: attaches them, polls what drivers asked for
//! and reports what the adapter sees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       BleNetwork                        │
//! │   (register / unregister / read / write / discovery)    │
//! └──────┬──────────────┬──────────────────┬────────────────┘
//!        │              │                  │
//!        ▼              ▼                  ▼
//! ┌────────────┐  ┌─────────────┐   ┌─────────────┐
//! │  Registry  │◄─┤   Polling   │   │   Scanner   │
//! │            │  │   worker    │   │  (discovery │
//! │ - devices  │  │             │   │   worker)   │
//! │ - waiting  │◄─┼─────────────┼───┤             │
//! └────────────┘  └──────┬──────┘   └──────┬──────┘
//!                        │                 │
//!                        ▼                 ▼
//!                 ┌─────────────┐   ┌─────────────┐
//!                 │  Connection │   │  Discovery  │
//!                 │  + Radio    │   │  dispatch   │
//!                 └──────┬──────┘   │ (unordered) │
//!                        ▼          └─────────────┘
//!                 ┌─────────────┐
//!                 │   Value     │
//!                 │  dispatch   │
//!                 │  (ordered)  │
//!                 └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`radio`] - Transport abstraction the engine talks to
//! - [`protocol`] - GATT UUID helpers and well-known identifiers
//! - [`connection`] - Connect-on-demand and handle resolution
//! - [`registry`] - Managed devices and the waiting-for-discovery set
//! - [`polling`] - Sweep schedule and polling worker
//! - [`scanner`] - Discovery worker
//! - [`dispatch`] - Ordered value and unordered discovery delivery
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-memory radio

pub mod connection;
pub mod dispatch;
pub mod polling;
pub mod protocol;
pub mod radio;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod simulated;

// Re-export main service for convenience
pub use service::BleNetwork;
