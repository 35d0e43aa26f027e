//! # relay-controller
//!
//! The operator side of a relay session. Dials the agent, keeps the link
//! alive through the [`ReconnectionManager`], uploads files and runs
//! clipboard sync over a [`ControlChannel`].
//!
//! [`ReconnectionManager`]: relay_core::ReconnectionManager
//! [`ControlChannel`]: relay_core::ControlChannel

pub mod service;
