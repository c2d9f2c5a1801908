// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Factories: acceptors bound to one `(interface-ip, port)` pair that
//! produce sessions for inbound connections. See spec §3 ("Factory") and
//! §4.5.

use std::collections::HashMap;

use crate::global::IdSequence;
use crate::path::clause_matches;
use crate::session::{Session, SessionId};

pub type FactoryId = u32;

/// Produces a `Session` for each inbound connection, or refuses it.
pub trait Factory {
    fn create_session(&mut self, client_address: &str, local_iap: &str, ids: &IdSequence) -> Option<Session>;

    fn is_ready_to_accept_sessions(&self) -> bool {
        true
    }

    /// Called by the server once a session this factory produced has been
    /// fully removed, so per-host counters can be released.
    fn session_removed(&mut self, _client_address: &str) {}

    /// Adds a ban pattern, per `PR_COMMAND_ADDBANS` (spec §4.6). Factories
    /// with no ban list of their own (e.g. `BasicFactory`) ignore this.
    fn add_ban(&mut self, _pattern: &str) {}

    /// Removes a ban pattern, per `PR_COMMAND_REMOVEBANS` (spec §4.6).
    fn remove_ban(&mut self, _pattern: &str) {}
}

/// The simplest factory: admits every connection, naming the session's
/// hostname after the client's address.
pub struct BasicFactory {
    id: FactoryId,
}

impl BasicFactory {
    pub fn new(id: FactoryId) -> BasicFactory {
        BasicFactory { id }
    }

    pub fn id(&self) -> FactoryId {
        self.id
    }
}

impl Factory for BasicFactory {
    fn create_session(&mut self, client_address: &str, _local_iap: &str, ids: &IdSequence) -> Option<Session> {
        Some(Session::new(SessionId(ids.next()), Some(client_address.to_owned())))
    }
}

/// The policy-enforcement collaborator from spec §4.5: wraps a slave
/// factory and refuses admission on a ban/require pattern match or a
/// session-count cap, before ever asking the slave to build a `Session`.
pub struct FilterFactory<F: Factory> {
    slave: F,
    ban_patterns: Vec<String>,
    require_patterns: Vec<String>,
    max_sessions: Option<u32>,
    max_sessions_per_host: Option<u32>,
    total_sessions: u32,
    sessions_per_host: HashMap<String, u32>,
}

impl<F: Factory> FilterFactory<F> {
    pub fn new(slave: F) -> FilterFactory<F> {
        FilterFactory {
            slave,
            ban_patterns: Vec::new(),
            require_patterns: Vec::new(),
            max_sessions: None,
            max_sessions_per_host: None,
            total_sessions: 0,
            sessions_per_host: HashMap::new(),
        }
    }

    pub fn with_bans(mut self, patterns: Vec<String>) -> Self {
        self.ban_patterns = patterns;
        self
    }

    pub fn with_requires(mut self, patterns: Vec<String>) -> Self {
        self.require_patterns = patterns;
        self
    }

    pub fn with_max_sessions(mut self, max: Option<u32>) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_max_sessions_per_host(mut self, max: Option<u32>) -> Self {
        self.max_sessions_per_host = max;
        self
    }

    fn is_banned(&self, client_address: &str) -> bool {
        self.ban_patterns.iter().any(|p| clause_matches(p, client_address))
    }

    fn is_required(&self, client_address: &str) -> bool {
        self.require_patterns.is_empty() || self.require_patterns.iter().any(|p| clause_matches(p, client_address))
    }
}

impl<F: Factory> Factory for FilterFactory<F> {
    fn create_session(&mut self, client_address: &str, local_iap: &str, ids: &IdSequence) -> Option<Session> {
        if self.is_banned(client_address) || !self.is_required(client_address) {
            return None;
        }
        if let Some(max) = self.max_sessions {
            if self.total_sessions >= max {
                return None;
            }
        }
        if let Some(max) = self.max_sessions_per_host {
            if *self.sessions_per_host.get(client_address).unwrap_or(&0) >= max {
                return None;
            }
        }

        let session = self.slave.create_session(client_address, local_iap, ids)?;
        self.total_sessions += 1;
        *self.sessions_per_host.entry(client_address.to_owned()).or_insert(0) += 1;
        Some(session)
    }

    fn is_ready_to_accept_sessions(&self) -> bool {
        self.slave.is_ready_to_accept_sessions()
    }

    fn session_removed(&mut self, client_address: &str) {
        self.total_sessions = self.total_sessions.saturating_sub(1);
        if let Some(count) = self.sessions_per_host.get_mut(client_address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.sessions_per_host.remove(client_address);
            }
        }
        self.slave.session_removed(client_address);
    }

    fn add_ban(&mut self, pattern: &str) {
        self.ban_patterns.push(pattern.to_owned());
    }

    fn remove_ban(&mut self, pattern: &str) {
        self.ban_patterns.retain(|p| p != pattern);
    }
}

/// Composes filters ahead of a slave factory without owning any
/// bans/requires of its own, per spec §3 ("May proxy another factory
/// (compose filters)"). The extra predicate can express admission control
/// not covered by `FilterFactory` (e.g. time-of-day gating).
pub struct ProxyFactory {
    slave: Box<dyn Factory>,
    extra_admission: Option<Box<dyn Fn(&str) -> bool>>,
}

impl ProxyFactory {
    pub fn new(slave: Box<dyn Factory>) -> ProxyFactory {
        ProxyFactory { slave, extra_admission: None }
    }

    pub fn with_admission_check(mut self, check: Box<dyn Fn(&str) -> bool>) -> Self {
        self.extra_admission = Some(check);
        self
    }
}

impl Factory for ProxyFactory {
    fn create_session(&mut self, client_address: &str, local_iap: &str, ids: &IdSequence) -> Option<Session> {
        if let Some(check) = &self.extra_admission {
            if !check(client_address) {
                return None;
            }
        }
        self.slave.create_session(client_address, local_iap, ids)
    }

    fn is_ready_to_accept_sessions(&self) -> bool {
        self.slave.is_ready_to_accept_sessions()
    }

    fn session_removed(&mut self, client_address: &str) {
        self.slave.session_removed(client_address);
    }

    fn add_ban(&mut self, pattern: &str) {
        self.slave.add_ban(pattern);
    }

    fn remove_ban(&mut self, pattern: &str) {
        self.slave.remove_ban(pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_factory_admits_every_client() {
        let ids = IdSequence::new();
        let mut f = BasicFactory::new(0);
        let session = f.create_session("10.0.0.1", "0.0.0.0:2960", &ids).unwrap();
        assert_eq!(session.hostname(), Some("10.0.0.1"));
    }

    #[test]
    fn add_ban_and_remove_ban_mutate_the_ban_list_live() {
        let ids = IdSequence::new();
        let mut f = FilterFactory::new(BasicFactory::new(0));
        assert!(f.create_session("10.0.0.5", "x", &ids).is_some());

        f.add_ban("10.0.0.*");
        assert!(f.create_session("10.0.0.5", "x", &ids).is_none());

        f.remove_ban("10.0.0.*");
        assert!(f.create_session("10.0.0.5", "x", &ids).is_some());
    }

    #[test]
    fn proxy_factory_forwards_ban_mutation_to_its_slave() {
        let ids = IdSequence::new();
        let mut f = ProxyFactory::new(Box::new(FilterFactory::new(BasicFactory::new(0))));
        f.add_ban("10.0.0.*");
        assert!(f.create_session("10.0.0.5", "x", &ids).is_none());
    }

    #[test]
    fn filter_factory_rejects_banned_address() {
        let ids = IdSequence::new();
        let mut f = FilterFactory::new(BasicFactory::new(0)).with_bans(vec!["10.0.0.*".to_owned()]);
        assert!(f.create_session("10.0.0.5", "x", &ids).is_none());
        assert!(f.create_session("192.168.0.5", "x", &ids).is_some());
    }

    #[test]
    fn filter_factory_requires_a_matching_pattern_when_any_are_set() {
        let ids = IdSequence::new();
        let mut f = FilterFactory::new(BasicFactory::new(0)).with_requires(vec!["192.168.*".to_owned()]);
        assert!(f.create_session("10.0.0.5", "x", &ids).is_none());
        assert!(f.create_session("192.168.0.5", "x", &ids).is_some());
    }

    #[test]
    fn filter_factory_enforces_per_host_cap() {
        let ids = IdSequence::new();
        let mut f = FilterFactory::new(BasicFactory::new(0)).with_max_sessions_per_host(Some(1));
        assert!(f.create_session("10.0.0.5", "x", &ids).is_some());
        assert!(f.create_session("10.0.0.5", "x", &ids).is_none());
        f.session_removed("10.0.0.5");
        assert!(f.create_session("10.0.0.5", "x", &ids).is_some());
    }

    #[test]
    fn filter_factory_enforces_aggregate_cap() {
        let ids = IdSequence::new();
        let mut f = FilterFactory::new(BasicFactory::new(0)).with_max_sessions(Some(1));
        assert!(f.create_session("10.0.0.1", "x", &ids).is_some());
        assert!(f.create_session("10.0.0.2", "x", &ids).is_none());
    }
}
