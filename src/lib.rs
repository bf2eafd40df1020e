//! Route one network session's traffic through a remote host over SSH.
//!
//! A loopback SOCKS5 listener accepts the session's connections and relays
//! each one over a forwarded channel of a single multiplexed SSH connection.
//! [`controller::TunnelController`] owns that connection's lifecycle;
//! [`probe::test`] checks reachability without starting a tunnel.

pub mod config;
pub mod controller;
pub mod logging;
pub mod network_session;
pub mod probe;
pub mod proxy;
pub mod relay;
pub mod resume;
pub mod socks;
mod ssh_driver;
pub mod ssh_transport;
pub mod transport;
pub mod tunnel_stats;

#[cfg(test)]
mod test_transport;


#[cfg(test)]
mod relay_tests;
