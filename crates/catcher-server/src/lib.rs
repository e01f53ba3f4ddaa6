//! Reference coordination service: per-group RUN/STOP signals and the global
//! kill flag, shared by every engine instance.

pub mod auth;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
