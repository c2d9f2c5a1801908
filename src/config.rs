// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Typed configuration knobs for a reflect server, plus the "central
//! state" side-channel Message. The CLI argument parser that would
//! normally fill these in (spec §6) is an external collaborator out of
//! scope for this crate; `ServerConfig` is built programmatically by the
//! embedding application instead.

use std::collections::HashMap;
use std::rc::Rc;

use crate::message::Message;

/// The knobs named in spec §6's CLI surface, minus the argument-parsing
/// machinery itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `maxmessagesize`. `None` means unlimited, matching the daemon's
    /// default (spec §9, Open Questions: frames strictly greater than
    /// this are rejected, never frames equal to it).
    pub max_message_size: Option<u32>,
    /// `maxmem`, in bytes. Consulted by the optional global-allocator
    /// wrapper described in spec §5; `None` disables the cap.
    pub max_memory_bytes: Option<u64>,
    /// `maxsendrate` / `maxreceiverate`, bytes/sec. `None` means unlimited.
    pub max_send_rate: Option<u32>,
    pub max_receive_rate: Option<u32>,
    /// `maxcombinedrate`, bytes/sec, shared across every session.
    pub max_combined_rate: Option<u32>,
    /// `maxsessions`.
    pub max_sessions: Option<u32>,
    /// `maxsessionsperhost`.
    pub max_sessions_per_host: Option<u32>,
    /// `maxnodespersession`: live data-node cap enforced per session by
    /// the tree (see `original_source/reflector/StorageReflectSession.h`).
    pub max_nodes_per_session: Option<u32>,
    /// Maximum depth of the data-node tree (spec §3 invariant, default 100).
    pub max_node_depth: u32,
    /// Maximum number of children a single data node may own.
    pub max_children_per_node: u32,
    /// Caps how many per-session fields one `PR_RESULT_DATAITEMS`
    /// notification may batch before a new one is started (spec §4.6).
    pub max_fields_per_notification: u32,
    /// `ban=<glob>` / `require=<glob>`, matched against the client's IP
    /// address string.
    pub ban_patterns: Vec<String>,
    pub require_patterns: Vec<String>,
    /// `privkick` / `privban` / `privunban` / `privall`: IP patterns that
    /// are exempt from, respectively, being kicked, being banned, having
    /// their ban lifted by someone else, or needing any of the above
    /// checked at all.
    pub priv_kick_patterns: Vec<String>,
    pub priv_ban_patterns: Vec<String>,
    pub priv_unban_patterns: Vec<String>,
    pub priv_all_patterns: Vec<String>,
    /// `remap=<oldip>=<newip>`.
    pub address_remap: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_message_size: None,
            max_memory_bytes: None,
            max_send_rate: None,
            max_receive_rate: None,
            max_combined_rate: None,
            max_sessions: None,
            max_sessions_per_host: None,
            max_nodes_per_session: None,
            max_node_depth: 100,
            max_children_per_node: u32::MAX,
            max_fields_per_notification: 4096,
            ban_patterns: Vec::new(),
            require_patterns: Vec::new(),
            priv_kick_patterns: Vec::new(),
            priv_ban_patterns: Vec::new(),
            priv_unban_patterns: Vec::new(),
            priv_all_patterns: Vec::new(),
            address_remap: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig::default()
    }

    pub fn remap_address<'a>(&'a self, ip: &'a str) -> &'a str {
        self.address_remap.get(ip).map(String::as_str).unwrap_or(ip)
    }
}

/// The server's shared side-channel Message (spec §4.7, "Central state"):
/// a grab-bag available to every component through `ReflectServer::central_state`
/// for knobs that aren't worth a typed `ServerConfig` field, such as ad hoc
/// privilege pattern lists an embedding app wants to thread through
/// without changing this crate.
#[derive(Debug, Default)]
pub struct CentralState {
    message: Rc<Message>,
}

impl CentralState {
    pub fn new() -> CentralState {
        CentralState { message: Rc::new(Message::new(0)) }
    }

    pub fn get(&self) -> &Rc<Message> {
        &self.message
    }

    pub fn set(&mut self, message: Rc<Message>) {
        self.message = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_falls_back_to_original_address() {
        let mut cfg = ServerConfig::new();
        cfg.address_remap.insert("10.0.0.1".to_owned(), "192.168.0.1".to_owned());
        assert_eq!(cfg.remap_address("10.0.0.1"), "192.168.0.1");
        assert_eq!(cfg.remap_address("10.0.0.2"), "10.0.0.2");
    }
}
