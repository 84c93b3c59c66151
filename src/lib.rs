//! Carrier-Ethernet service activation.
//!
//! Services are split into endpoint pairs, each pair is bound to a driver
//! from the [`drivers::DriverRepository`], and all drivers of a service run
//! as one two-phase transaction. VLAN tags come from per-device pools and,
//! for rooted-multipoint services, from the E-Tree sub-range pool.

pub mod activation;
pub mod config;
pub mod db;
pub mod drivers;
pub mod error;
pub mod models;
pub mod topology;
pub mod vlan;
