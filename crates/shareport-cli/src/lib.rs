//! Library side of the `shareport` binary
pub mod config;
pub mod login;
pub mod share;
pub mod watch;
