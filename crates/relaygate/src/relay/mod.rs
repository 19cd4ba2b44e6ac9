//! Relay side of the gateway: dialing the TURN server, the TURN client, and
//! the TCP allocation peers reach the gateway through.

pub mod allocation;
pub mod client;
pub mod dialer;
#[cfg(test)]
pub(crate) mod testing;

pub use allocation::{AllocationHandle, TcpAllocation};
