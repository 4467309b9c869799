//! Tandem - session lifecycle for web applications
//!
//! Keeps a fast ephemeral session cache and a durable session table
//! consistent across identifier rotation, eviction and sign-out.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
