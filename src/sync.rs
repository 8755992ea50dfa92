//! Synchronisation primitives that cross the hub's thread boundary.

pub mod mpsc;
