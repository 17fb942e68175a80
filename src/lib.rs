//! Host-side client for `AirPods`-class accessories.
//!
//! Combines an AAP control session (settings, speaking level, ear
//! detection) with a reconciler that tracks the device's live state from
//! its rotating-address BLE broadcasts.

pub mod airpods;
pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod media;
pub mod orchestrator;
