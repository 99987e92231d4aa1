//! Process-management daemon: supervises server instances and tunnel clients, fans their
//! output out to connected panels, runs scheduled tasks and provisioning jobs.

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod scheduler;
pub mod security;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod ws;
