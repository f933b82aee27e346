//! NBD (Network Block Device) front end
//!
//! Speaks the fixed newstyle protocol and forwards each request to the
//! outermost backend of a [`Chain`](crate::chain::Chain).

pub mod protocol;
pub mod server;

pub use server::{serve, NbdServer, NbdServerConfig, Scheduler};
