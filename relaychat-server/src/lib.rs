#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::multiple_crate_versions)] // TODO(deps-001): remove once transitive dependencies converge.

//! relaychat writer and reader processes.
//!
//! Writers run commands against the store and publish the resulting events.
//! Readers answer queries and forward broker events to connected clients.
//! A combined process does both.

pub mod app_state;
pub mod broker;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
mod tracer;
