//! stackup - local deployment manager for the factor/quantflow analytics stack
//!
//! Installs, configures, and launches a multi-service analytics stack on a
//! developer machine: the factor web server, the quantflow workflow server,
//! and a local MongoDB instance. Deployment progress is persisted to a small
//! JSON status file so an interrupted run resumes where it left off.

pub mod conda;
pub mod config;
pub mod deploy;
pub mod events;
pub mod exec;
pub mod git;
pub mod launch;
pub mod logging;
pub mod probes;
pub mod scripts;
pub mod state;
