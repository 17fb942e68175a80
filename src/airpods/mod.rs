//! `AirPods` protocol and device state.
//!
//! The AAP codec and session live next to the broadcast side: advertisement
//! decoding, model tables and the reconciler that turns broadcasts into one
//! device state.

pub mod advertisement;
pub mod model;
pub mod parser;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod state;
