// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The `Session`: an endpoint owning a gateway, a `DataIO`, and the
//! subscription/routing state attached to one connected peer. See spec
//! §3 ("Session") and §4.5.
//!
//! The teacher's deep socket-type hierarchy (`Pair`/`Pub`/`Sub`/...) is
//! replaced per the design notes with one concrete `Session` struct whose
//! behavior is governed by a `RoutingFlags` config value rather than a
//! subclass: the "routing flags bitset becomes a config field on the base
//! session."

use std::fmt;
use std::rc::Rc;

use crate::bandwidth::PolicyId;
use crate::data_node::NodeId;
use crate::gateway::{DataIO, Gateway};
use crate::message::Message;
use crate::path::QueryFilter;
use crate::pulse::NEVER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Governs the base "dumb reflect" forwarding behavior (spec §4.5):
/// messages arriving from the gateway are, by default, forwarded to
/// neighbor sessions, and messages arriving from a neighbor session are,
/// by default, forwarded back out the gateway. Both directions are
/// individually toggleable.
#[derive(Debug, Clone, Copy)]
pub struct RoutingFlags {
    pub forward_gateway_to_neighbors: bool,
    pub forward_neighbors_to_gateway: bool,
}

impl Default for RoutingFlags {
    fn default() -> Self {
        RoutingFlags { forward_gateway_to_neighbors: true, forward_neighbors_to_gateway: true }
    }
}

/// A single active subscription: a path pattern plus the optional query
/// filter that gates it, keyed by the raw `SUBSCRIBE:<pattern>` field name
/// so it can be removed by the same key later.
pub struct Subscription {
    pub field_name: String,
    pub pattern: String,
    pub filter: Option<QueryFilter>,
}

#[derive(Debug, Clone)]
pub struct ReconnectParams {
    pub destination: Option<String>,
    /// Microseconds to wait before reconnecting after a close, or [`NEVER`]
    /// to disable auto-reconnect.
    pub delay_micros: u64,
    pub max_async_connect_period_micros: u64,
}

impl Default for ReconnectParams {
    fn default() -> Self {
        ReconnectParams { destination: None, delay_micros: NEVER, max_async_connect_period_micros: NEVER }
    }
}

/// An endpoint: a session id, an optional attached gateway/`DataIO` pair,
/// a home node, a set of subscriptions, and the bookkeeping spec §4.5
/// requires (routing flags, bandwidth policy references, reconnect
/// parameters).
pub struct Session {
    id: SessionId,
    id_string: String,
    hostname: Option<String>,
    gateway: Option<Box<dyn Gateway>>,
    data_io: Option<Box<dyn DataIO>>,
    home_node: Option<NodeId>,
    subscriptions: Vec<Subscription>,
    default_route: Option<QueryFilter>,
    pub input_policy: Option<PolicyId>,
    pub output_policy: Option<PolicyId>,
    pub reconnect: ReconnectParams,
    pub routing: RoutingFlags,
    parameters: Message,
    max_nodes: Option<u32>,
    live_node_count: u32,
    marked_for_removal: bool,
    attached: bool,
}

impl Session {
    pub fn new(id: SessionId, hostname: Option<String>) -> Session {
        Session {
            id_string: id.to_string(),
            id,
            hostname,
            gateway: None,
            data_io: None,
            home_node: None,
            subscriptions: Vec::new(),
            default_route: None,
            input_policy: None,
            output_policy: None,
            reconnect: ReconnectParams::default(),
            routing: RoutingFlags::default(),
            parameters: Message::new(0),
            max_nodes: None,
            live_node_count: 0,
            marked_for_removal: false,
            attached: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn id_string(&self) -> &str {
        &self.id_string
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// The path under which this session's own data lives:
    /// `/<hostname>/<sessionid>/`.
    pub fn home_path(&self) -> String {
        format!("{}/{}", self.hostname.as_deref().unwrap_or("default"), self.id_string)
    }

    pub fn set_max_nodes(&mut self, max: Option<u32>) {
        self.max_nodes = max;
    }

    pub fn nodes_remaining(&self) -> Option<u32> {
        self.max_nodes.map(|max| max.saturating_sub(self.live_node_count))
    }

    pub fn record_node_created(&mut self) {
        self.live_node_count += 1;
    }

    pub fn record_node_removed(&mut self) {
        self.live_node_count = self.live_node_count.saturating_sub(1);
    }

    pub fn attach_gateway(&mut self, gateway: Box<dyn Gateway>) {
        self.gateway = Some(gateway);
    }

    pub fn attach_data_io(&mut self, io: Box<dyn DataIO>) {
        self.data_io = Some(io);
    }

    pub fn gateway(&self) -> Option<&dyn Gateway> {
        self.gateway.as_deref()
    }

    pub fn gateway_mut(&mut self) -> Option<&mut Box<dyn Gateway>> {
        self.gateway.as_mut()
    }

    pub fn data_io_mut(&mut self) -> Option<&mut Box<dyn DataIO>> {
        self.data_io.as_mut()
    }

    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    /// Runs once the session's id and home node both exist (spec §3).
    pub fn attached_to_server(&mut self, home_node: NodeId) {
        self.home_node = Some(home_node);
        self.attached = true;
    }

    /// Runs before the home subtree is deleted (spec §3).
    pub fn about_to_detach_from_server(&mut self) {
        self.attached = false;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn home_node(&self) -> Option<NodeId> {
        self.home_node
    }

    pub fn mark_for_removal(&mut self) {
        self.marked_for_removal = true;
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    /// Queues `msg` for delivery if this session has an attached gateway;
    /// silently drops it otherwise (an unattached session has nowhere to
    /// send).
    pub fn add_outgoing_message(&mut self, msg: Rc<Message>) {
        if let Some(gateway) = &mut self.gateway {
            gateway.add_outgoing_message(msg);
        }
    }

    /// Default policy: returning `true` accepts removal immediately. A
    /// session wanting auto-reconnect instead should set
    /// `reconnect.delay_micros` to something other than [`NEVER`] and
    /// return `false`.
    pub fn client_connection_closed(&mut self) -> bool {
        self.reconnect.delay_micros == NEVER
    }

    pub fn add_subscription(&mut self, field_name: &str, pattern: &str, filter: Option<QueryFilter>) {
        self.subscriptions.retain(|s| s.field_name != field_name);
        self.subscriptions.push(Subscription { field_name: field_name.to_owned(), pattern: pattern.to_owned(), filter });
    }

    pub fn remove_subscription(&mut self, field_name: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.field_name != field_name);
        self.subscriptions.len() != before
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn parameters(&self) -> &Message {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Message {
        &mut self.parameters
    }

    pub fn set_default_route_filter(&mut self, filter: Option<QueryFilter>) {
        self.default_route = filter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_path_uses_hostname_and_id_string() {
        let s = Session::new(SessionId(7), Some("client.example".to_owned()));
        assert_eq!(s.home_path(), "client.example/7");
    }

    #[test]
    fn default_client_connection_closed_accepts_removal() {
        let mut s = Session::new(SessionId(1), None);
        assert!(s.client_connection_closed());
    }

    #[test]
    fn reconnect_delay_suppresses_immediate_removal() {
        let mut s = Session::new(SessionId(1), None);
        s.reconnect.delay_micros = 1_000_000;
        assert!(!s.client_connection_closed());
    }

    #[test]
    fn subscription_add_replaces_same_field_name() {
        let mut s = Session::new(SessionId(1), None);
        s.add_subscription("SUBSCRIBE:foo/*", "foo/*", None);
        s.add_subscription("SUBSCRIBE:foo/*", "foo/bar", None);
        assert_eq!(s.subscriptions().len(), 1);
        assert_eq!(s.subscriptions()[0].pattern, "foo/bar");
    }

    #[test]
    fn nodes_remaining_counts_down_from_cap() {
        let mut s = Session::new(SessionId(1), None);
        s.set_max_nodes(Some(2));
        assert_eq!(s.nodes_remaining(), Some(2));
        s.record_node_created();
        assert_eq!(s.nodes_remaining(), Some(1));
        s.record_node_created();
        assert_eq!(s.nodes_remaining(), Some(0));
    }
}
