//! System layer: OS-level socket controls.

pub mod protect;
pub mod socket;
