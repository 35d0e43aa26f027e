//! # relay-agent
//!
//! The remote side of a relay session. Listens for a controller, accepts
//! one connection at a time and serves it through a [`ControlChannel`]:
//! uploaded files land in the download directory and clipboard changes
//! flow both ways.
//!
//! The frame queues outlive each connection, so a controller that drops
//! and redials picks up where it left off.
//!
//! [`ControlChannel`]: relay_core::ControlChannel

pub mod service;
