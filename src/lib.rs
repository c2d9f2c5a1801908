// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! MUSCLE: a message-reflection server and its embedding library.
//!
//! TCP/UDP clients connect, publish structured [`Message`]s into a shared
//! hierarchical data-node tree, and subscribe to parts of that tree so
//! that writes are multicast to every interested peer. This crate is the
//! reflect server core: the session table, the data-node tree and its
//! subscription dispatch, the pulse/timer scheduler, the bandwidth-policy
//! layer, and the on-wire framed-message codec. The event loop that wires
//! all of these together lives in [`server::ReflectServer`].
//!
//! Concrete transports beyond TCP/UDP (serial lines, child processes, TLS),
//! the CLI argument parser of a standalone daemon, and shared-memory
//! access control are treated as external collaborators and are not part
//! of this crate; see each module's doc comment for the narrow trait
//! boundary they would plug into.

pub mod bandwidth;
pub mod codec;
pub mod config;
pub mod data_node;
pub mod error;
pub mod factory;
pub mod gateway;
mod global;
pub mod message;
pub mod path;
pub mod pulse;
pub mod reflect;
pub mod server;
pub mod session;
pub mod signal;
pub mod transport;

pub use config::ServerConfig;
pub use error::{MuscleError, MuscleResult};
pub use message::{Field, Message};
pub use server::ReflectServer;
pub use session::{Session, SessionId};
