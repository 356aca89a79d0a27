//! Relay/agent tunnelling over a line-delimited JSON control protocol.
//!
//! The relay accepts agent control connections and public traffic; the agent
//! registers tunnels and answers `new_conn` by opening a data connection that the
//! relay splices with the waiting public connection.

pub mod agent;
pub mod bridge;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod status;

#[cfg(test)]
mod e2e_tests;
