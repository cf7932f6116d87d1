//! Friend-to-friend connection management on top of the [transport] crate: figure out how
//!  reachable this machine is, get and keep logical connections to friends, and download
//!  files from them at an adaptively tuned rate.
//!
//! The crate owns no accounts, no certificates, no TCP sockets and no file storage; all of
//!  that is injected through the traits in [boundary]. What it does own:
//!
//! * [probe::ConnectivityProbe] classifies our NAT/firewall situation with STUN-style binding
//!   round-trips (friends first, public servers as fallback) and router auto-configuration,
//!   moving through an ordered sequence of steps to a terminal verdict.
//! * [scheduler::PeerScheduler] turns the directory's friend list plus the probe's verdict
//!   into connection attempts (local TCP, external TCP, connect-back, UDP streams), with
//!   per-attempt-type backoff and NAT tunneler heartbeats while hole punching.
//! * [transfer::TransferModule] requests byte ranges from connected friends, sizing each
//!   request from the measured duration of the previous request/response cycle.
//! * [node::PeerNode] binds the two sockets and drives everything from one select loop.
//!
//! Everything is tick-driven: a 1 second cooperative tick plus the sockets' receive loops,
//!  no hidden background timers.

pub mod boundary;
pub mod config;
pub mod events;
pub mod node;
pub mod probe;
pub mod scheduler;
pub mod transfer;
