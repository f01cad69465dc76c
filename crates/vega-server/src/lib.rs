//! # vega-server
//!
//! HTTP server library for the vega detector daemon.
//!
//! This library provides the API handlers, logging setup and shared state
//! used by the `vega-server` binary.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
