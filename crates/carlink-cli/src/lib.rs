//! `carlink` CLI
//!
//! Runs a simulated head unit and phone against the real key store, and
//! manages the devices paired into it.

pub mod device_cmd;
pub mod loopback;
pub mod pair_cmd;
