//! API Middleware

pub mod auth;

pub use auth::{resolve_caller, Caller};
