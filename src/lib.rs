//! V2X Highway Coordination Library
//!
//! The per-tick coordination core of a cooperative multi-vehicle highway.
//! Each vehicle node exchanges telemetry over a publish/subscribe transport
//! and reacts to its peers; the core can run headless with any number of
//! nodes on an in-process broker.

pub mod coordination;
