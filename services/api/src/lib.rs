//! Mentor API Library Crate
//!
//! This library contains all the logic for the tutoring web service: the
//! application state, persistence stores, the turn orchestrator, API
//! handlers and routing. The binaries are thin wrappers around it.

pub mod config;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod router;
pub mod state;
pub mod store;
