#![forbid(unsafe_code)]
//! Server side TNFS protocol engine for Rust.
//!
//! TNFS (the "Trivial Network File System") is a small file-serving protocol designed
//! for 8-bit machines. Requests are short datagrams carried over UDP, with an optional
//! TCP fallback for networks where UDP is unreliable. A client mounts a directory,
//! receives a 16-bit session ID and then addresses every later request to that session.
//!
//! # Overview
//!
//! This crate provides the protocol/session engine of a TNFS server:
//!
//! - [`event`] – one readiness interface over epoll, kqueue, `poll(2)` and `select(2)`,
//!   selected at startup.
//! - [`conn::ConnectionTable`] – fixed-capacity table of TCP connections.
//! - [`session::SessionRegistry`] – sessions and their retransmission state.
//! - [`auth::AccessGate`] – the read-only mode predicate.
//! - [`srv::Server`] – the single-threaded reactor which receives requests, validates
//!   them and routes them to a [`srv::Filesystem`] implementation.
//!
//! # Getting Started
//!
//! 1. Define a type to hold per-session state (open files, the mounted root, ...)
//! 2. Implement [`srv::Filesystem`] for your filesystem type
//! 3. Bind a [`srv::Server`] and call [`srv::Server::run`]
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use tnfs::{srv::{Config, Filesystem, Server}, Result, Reply};
//!
//! struct MyFs;
//!
//! impl Filesystem for MyFs {
//!     type Session = ();
//!
//!     fn rmount(&self, _session: &mut (), _path: &str, _user: &str, _password: &str) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     // Implement other command handlers...
//! }
//!
//! fn main() -> Result<()> {
//!     let running = AtomicBool::new(true);
//!     let mut server = Server::bind(MyFs, Config::default())?;
//!     server.run(&running)
//! }
//! ```
//!
//! # Protocol Details
//!
//! Every message starts with a four byte header: the session ID (little-endian
//! 16-bit), a sequence number and a command byte. Responses append a status byte and a
//! command specific payload. The high nibble of the command byte selects the command
//! class (session, directory or file); the low nibble indexes the command within it.
//!
//! Retransmission is client driven: a client that did not see a reply repeats the
//! request with the same sequence number, and the server answers with the cached reply
//! instead of executing the command again.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`). All OS readiness
//! interfaces are reached through `nix`.
pub mod auth;
pub mod conn;
mod dispatch;
pub mod error;
pub mod event;
pub mod proto;
pub mod serialize;
pub mod session;
pub mod srv;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::proto::*;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}
