//! Autoscaling control loop for LXC containers on a virtualization cluster.
//!
//! The crate is organized around the flow of one evaluation cycle: the
//! [`gateway`] module is the abstract boundary to the cluster's management
//! API, [`metrics`] turns gateway reads into a bounded history,
//! [`scaling`] turns that history into decisions and applies them, and
//! [`controller`] schedules the whole thing as a daemon loop.

pub mod clock;
pub mod cli;
pub mod config;
pub mod controller;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod scaling;
