//! Upload relay: issues short-lived object-store write targets, relays small
//! files, assembles multipart uploads and records completed files. The
//! [`client`] module holds the orchestrator that drives those endpoints.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod routes;
pub mod services;
pub mod state;
