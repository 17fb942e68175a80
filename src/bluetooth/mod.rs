//! Bluetooth plumbing.
//!
//! AAP links over L2CAP, RFCOMM or the vendor driver, plus the BlueZ-backed
//! advertisement scanner and paired-device directory.

pub mod directory;
pub mod driver;
pub mod l2cap;
pub mod rfcomm;
pub mod scanner;
pub mod transport;
