//! # Configuration
//!
//! Layered process configuration shared by every relaychat role.

pub mod server;
