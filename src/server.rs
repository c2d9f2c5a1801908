// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The reflect server: a single-threaded event loop owning the session
//! table, the data-node tree, the pulse scheduler, and the bandwidth
//! policies. See spec §4.7 (component 7, the hard-engineering core) and
//! §5 ("Concurrency & resource model").
//!
//! The teacher's `EventLoop`/`SocketImpl` pairing (a background-thread
//! event loop driven by `mio::Sender` commands and `mpsc` notification
//! channels, see the removed `socket_impl.rs`/`event_loop_msg.rs`) is
//! replaced per the design notes: MUSCLE is single-threaded and
//! cooperative (spec §5), so there is exactly one `mio::Poll` and no
//! cross-thread channel at all. `ReflectServer::run_once` *is* the
//! teacher's `EventLoop::run` turned inside out into a single borrowed
//! call instead of an owned background loop.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::bandwidth::{BandwidthPolicy, PolicyHolder, PolicyId};
use crate::config::{CentralState, ServerConfig};
use crate::data_node::{DataNodeTree, SetDataNodeFlags};
use crate::error::{permission_denied, MuscleError, MuscleResult};
use crate::factory::{Factory, FactoryId};
use crate::gateway::{FramedMessageGateway, Gateway, GatewayMessageReceiver};
use crate::global::IdSequence;
use crate::message::{what, Message};
use crate::pulse::{self, PulseCallback, PulseTree, NEVER};
use crate::reflect;
use crate::session::{Session, SessionId};
use crate::transport::TcpDataIO;

/// Anything a pulse-tree node participating as a bandwidth-policy
/// re-enable wakeup must implement; the canonical `RateLimiter`
/// satisfies both halves already.
pub trait Policy: BandwidthPolicy + PulseCallback {}
impl<T: BandwidthPolicy + PulseCallback> Policy for T {}

/// The default read/write chunk size used for a session with no
/// bandwidth policy attached (policies are optional per spec §3).
const UNTHROTTLED_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenOwner {
    Session(SessionId),
    Factory(FactoryId),
}

/// Bookkeeping the server needs about an attached session that isn't
/// part of `Session` itself (spec §3 describes the session's own fields;
/// the mio token, the accepting factory and the client address string
/// are purely the server's business). Kept in a side table, keyed by
/// `SessionId`, so `reflect::handle_command` and friends can keep
/// operating directly on a plain `HashMap<SessionId, Session>` without an
/// adapter layer.
struct SessionMeta {
    token: Token,
    client_address: String,
    factory_id: Option<FactoryId>,
    /// Set while an outbound (client-side) TCP connect is in flight, so
    /// the deferred-removal pass can enforce `maxAsyncConnectPeriod`
    /// (spec §4.5, `Reconnect()`).
    connecting_since: Option<u64>,
}

struct FactoryEntry {
    factory: Box<dyn Factory>,
    listener: TcpListener,
    local_iap: String,
}

/// A session-level timer, flat rather than tree-shaped: unlike the
/// bandwidth policies' pulse participation (queried directly every
/// iteration, see `earliest_policy_pulse`), a pending reconnect is a
/// one-shot deadline with no children of its own, so a sorted `Vec` is
/// the simplest correct structure and the full three-sibling-list
/// algorithm buys nothing here (see DESIGN.md).
struct PendingReconnect {
    at: u64,
    session: SessionId,
}

/// Implements spec §4.9: the signal session owns one end of a pipe; the
/// reflect server decodes records from it and reacts to each signal
/// number with `EndServer()` by default. Kept as a plain struct (not a
/// `Session`) since its "home" is the server's shutdown flag, not the
/// data-node tree.
pub struct SignalPipe {
    io: Box<dyn crate::gateway::DataIO>,
    token: Token,
}

pub struct ReflectServer {
    poll: Poll,
    events: Events,
    sessions: HashMap<SessionId, Session>,
    session_meta: HashMap<SessionId, SessionMeta>,
    factories: HashMap<FactoryId, FactoryEntry>,
    tokens: HashMap<Token, TokenOwner>,
    tree: DataNodeTree,
    policies: Vec<Box<dyn Policy>>,
    pulses: PulseTree,
    pending_reconnects: Vec<PendingReconnect>,
    central_state: CentralState,
    config: ServerConfig,
    session_ids: IdSequence,
    factory_ids: IdSequence,
    next_token: usize,
    signal_pipe: Option<SignalPipe>,
    shutdown_requested: bool,
}

/// A no-op root pulse callback; the server itself has no fixed pulse
/// time of its own, only aggregated children (sessions that add their
/// own pulse participants per spec §4.4).
struct RootPulse;
impl PulseCallback for RootPulse {}

impl ReflectServer {
    pub fn new(config: ServerConfig) -> io::Result<ReflectServer> {
        Ok(ReflectServer {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            sessions: HashMap::new(),
            session_meta: HashMap::new(),
            factories: HashMap::new(),
            tokens: HashMap::new(),
            tree: DataNodeTree::new(config.max_node_depth, config.max_children_per_node),
            policies: Vec::new(),
            pulses: PulseTree::new(Box::new(RootPulse)),
            pending_reconnects: Vec::new(),
            central_state: CentralState::new(),
            config,
            session_ids: IdSequence::new(),
            factory_ids: IdSequence::new(),
            next_token: 0,
            signal_pipe: None,
            shutdown_requested: false,
        })
    }

    pub fn central_state(&self) -> &Rc<Message> {
        self.central_state.get()
    }

    pub fn set_central_state(&mut self, msg: Rc<Message>) {
        self.central_state.set(msg);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers a bandwidth policy and returns the id sessions attach to
    /// via `Session::input_policy`/`output_policy` (spec §4.8).
    pub fn add_policy(&mut self, policy: Box<dyn Policy>) -> PolicyId {
        let id = self.policies.len();
        self.policies.push(policy);
        id
    }

    pub fn policy_mut(&mut self, id: PolicyId) -> Option<&mut Box<dyn Policy>> {
        self.policies.get_mut(id)
    }

    /// Binds a TCP factory to `addr`, starting to listen immediately.
    pub fn add_tcp_factory(&mut self, addr: SocketAddr, factory: Box<dyn Factory>) -> io::Result<FactoryId> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;

        let id = self.factory_ids.next();
        self.tokens.insert(token, TokenOwner::Factory(id));
        self.factories.insert(id, FactoryEntry { factory, listener, local_iap: addr.to_string() });
        Ok(id)
    }

    pub fn install_signal_pipe(&mut self, io: Box<dyn crate::gateway::DataIO>, source: &mut dyn mio::event::Source) -> io::Result<()> {
        let token = self.alloc_token();
        self.poll.registry().register(source, token, Interest::READABLE)?;
        self.signal_pipe = Some(SignalPipe { io, token });
        Ok(())
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Registers an already-accepted or already-connected session (used
    /// by the TCP accept path and by embedding applications wiring up a
    /// non-TCP `DataIO`, e.g. UDP). `token` must already be registered
    /// with `self.poll`: the concrete transport type has to be registered
    /// before it's boxed into a `dyn DataIO`, since `mio::event::Source`
    /// isn't part of that trait's object-safe surface.
    fn attach_session(
        &mut self,
        mut session: Session,
        client_address: String,
        factory_id: Option<FactoryId>,
        token: Token,
        gateway: Box<dyn Gateway>,
        data_io: Box<dyn crate::gateway::DataIO>,
    ) -> io::Result<SessionId> {
        let id = session.id();

        session.attach_gateway(gateway);
        session.attach_data_io(data_io);
        session.set_max_nodes(self.config.max_nodes_per_session);

        let home_path = session.home_path();
        let home_node = self
            .tree
            .set_data_node(&home_path, Rc::new(Message::new(0)), SetDataNodeFlags { is_being_created: true, enable_supercede: false }, None)
            .map_err(io::Error::from)?;
        self.tree.take_pending_changes();
        session.attached_to_server(home_node);

        let mut params = Message::new(what::PR_RESULT_PARAMETERS);
        params.add_u32("maxnodespersession", self.config.max_nodes_per_session.unwrap_or(0));
        params.add_i32("encodings", crate::gateway::Encoding::Uncompressed as i32);
        session.add_outgoing_message(Rc::new(params));

        self.tokens.insert(token, TokenOwner::Session(id));
        self.session_meta.insert(id, SessionMeta { token, client_address, factory_id, connecting_since: None });
        self.sessions.insert(id, session);
        Ok(id)
    }

    fn detach_session(&mut self, id: SessionId) -> io::Result<()> {
        let meta = match self.session_meta.remove(&id) {
            Some(m) => m,
            None => return Ok(()),
        };
        self.tokens.remove(&meta.token);

        if let Some(mut session) = self.sessions.remove(&id) {
            session.about_to_detach_from_server();
            let home_path = session.home_path();
            let _ = self.tree.remove_data_nodes(&home_path, None, false);
        }
        self.tree.remove_subscriber_everywhere(id);
        reflect::flush_pending(&mut self.tree, &mut self.sessions, self.config.max_fields_per_notification);

        if let Some(factory_id) = meta.factory_id {
            if let Some(f) = self.factories.get_mut(&factory_id) {
                f.factory.session_removed(&meta.client_address);
            }
        }
        Ok(())
    }

    /// The earliest absolute time (microseconds) at which any registered
    /// bandwidth policy wants to be woken to re-enable transfer (spec
    /// §4.8's optional `GetPulseTime` participation). Policies are
    /// queried directly rather than through the pulse tree: unlike
    /// sessions, there is a small, fixed number of them and they carry no
    /// children of their own, so the three-sibling-list machinery buys
    /// nothing (see DESIGN.md).
    fn earliest_policy_pulse(&mut self, now: u64) -> u64 {
        self.policies.iter_mut().map(|p| p.get_pulse_time(now, NEVER)).min().unwrap_or(NEVER)
    }

    /// One full iteration of the event loop, per spec §4.7's ten steps.
    /// Blocks for at most the time until the earliest pulse or bandwidth
    /// policy wakeup.
    pub fn run_once(&mut self) -> io::Result<()> {
        // Step 1+2: earliest pulse time, bandwidth policy round.
        let now = pulse::now_micros();
        for policy in self.policies.iter_mut() {
            policy.begin_io(now);
        }

        let mut read_caps: HashMap<SessionId, usize> = HashMap::new();
        let mut write_caps: HashMap<SessionId, usize> = HashMap::new();
        for (&id, session) in self.sessions.iter() {
            read_caps.insert(id, cap_for(&mut self.policies, session.input_policy, id, true));
            write_caps.insert(id, cap_for(&mut self.policies, session.output_policy, id, false));
        }

        let earliest_session_pulse = self.pulses.tick(now);
        let earliest_policy_pulse = self.earliest_policy_pulse(now);
        let earliest = earliest_session_pulse.min(earliest_policy_pulse);
        let timeout = pulse_timeout(earliest, now);

        // Step 3+4: build readiness set and block.
        self.poll.poll(&mut self.events, timeout)?;

        let ready: Vec<(Token, bool, bool)> =
            self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

        for (token, readable, writable) in ready {
            match self.tokens.get(&token).copied() {
                Some(TokenOwner::Factory(factory_id)) if readable => {
                    self.accept_loop(factory_id)?;
                }
                Some(TokenOwner::Session(session_id)) => {
                    if readable {
                        let cap = read_caps.get(&session_id).copied().unwrap_or(UNTHROTTLED_CHUNK);
                        self.do_input_for(session_id, cap);
                    }
                    if writable {
                        let cap = write_caps.get(&session_id).copied().unwrap_or(UNTHROTTLED_CHUNK);
                        self.do_output_for(session_id, cap);
                    }
                }
                None => {
                    if let Some(pipe) = &self.signal_pipe {
                        if token == pipe.token && readable {
                            self.drain_signals();
                        }
                    }
                }
                _ => {}
            }
        }

        // Flush anything a command handler queued onto a session other
        // than the one that triggered this iteration's input (e.g. a
        // subscriber being notified of another session's write). Relying
        // solely on mio's edge-triggered WRITABLE events would miss
        // these: a fd's writable edge can already have been consumed by
        // the time data shows up in its gateway's outgoing queue.
        let sessions_with_pending_output: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.gateway().map(|g| g.has_bytes_to_output()).unwrap_or(false))
            .map(|(&id, _)| id)
            .collect();
        for id in sessions_with_pending_output {
            let cap = write_caps.get(&id).copied().unwrap_or(UNTHROTTLED_CHUNK);
            self.do_output_for(id, cap);
        }

        // Step 8: pulse round already advanced by `tick` above; dispatch
        // reconnects whose deadline has passed.
        self.fire_due_reconnects(now);

        // Step 9: deferred removal.
        self.run_deferred_removal()?;

        // Step 10.
        for policy in self.policies.iter_mut() {
            policy.end_io(now);
        }

        Ok(())
    }

    pub fn run_until_shutdown(&mut self) -> io::Result<()> {
        while !self.shutdown_requested {
            self.run_once()?;
        }
        Ok(())
    }

    fn accept_loop(&mut self, factory_id: FactoryId) -> io::Result<()> {
        loop {
            let accepted = match self.factories.get_mut(&factory_id) {
                Some(f) => f.listener.accept(),
                None => return Ok(()),
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("factory {} accept failed: {}", factory_id, e);
                    return Ok(());
                }
            };

            let (local_iap, ready) = match self.factories.get(&factory_id) {
                Some(f) => (f.local_iap.clone(), f.factory.is_ready_to_accept_sessions()),
                None => return Ok(()),
            };
            if !ready {
                continue;
            }

            let client_address = addr.ip().to_string();
            let session = match self.factories.get_mut(&factory_id) {
                Some(f) => f.factory.create_session(&client_address, &local_iap, &self.session_ids),
                None => None,
            };

            let session = match session {
                Some(s) => s,
                None => continue, // banned / over capacity: drop the accepted socket
            };

            let mut stream = stream;
            let token = self.alloc_token();
            if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE) {
                warn!("failed to register accepted socket with poll: {}", e);
                continue;
            }

            let max_msg = self.config.max_message_size;
            let gateway: Box<dyn Gateway> = Box::new(FramedMessageGateway::new(max_msg));
            let data_io: Box<dyn crate::gateway::DataIO> = Box::new(TcpDataIO::new(stream));

            if let Err(e) = self.attach_session(session, client_address, Some(factory_id), token, gateway, data_io) {
                error!("failed to attach accepted session: {}", e);
            }
        }
    }

    fn do_input_for(&mut self, session_id: SessionId, max_bytes: usize) {
        let mut incoming: Vec<Rc<Message>> = Vec::new();
        let mut bytes_read = 0usize;
        let mut transport_failed = false;

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let (Some(io), Some(gateway)) = (session.data_io_mut(), session.gateway_mut()) {
                struct Collector<'a>(&'a mut Vec<Rc<Message>>);
                impl<'a> GatewayMessageReceiver for Collector<'a> {
                    fn message_received_from_gateway(&mut self, msg: Rc<Message>) {
                        self.0.push(msg);
                    }
                }
                let mut collector = Collector(&mut incoming);
                match gateway.do_input(io.as_mut(), max_bytes, &mut collector) {
                    Ok(n) => bytes_read = n,
                    Err(MuscleError::TransportFailed(e)) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(_) => transport_failed = true,
                }
            }
        }

        if let Some(pid) = self.sessions.get(&session_id).and_then(|s| s.input_policy) {
            if let Some(p) = self.policies.get_mut(pid) {
                p.bytes_transferred(PolicyHolder { session: session_id, is_input: true }, bytes_read as u32);
            }
        }

        for msg in incoming {
            let result = match msg.what {
                what::PR_COMMAND_KICK | what::PR_COMMAND_ADDBANS | what::PR_COMMAND_REMOVEBANS => {
                    self.dispatch_privileged_command(session_id, &msg)
                }
                _ => reflect::handle_command(
                    &mut self.tree,
                    &mut self.sessions,
                    session_id,
                    &msg,
                    self.config.max_fields_per_notification,
                ),
            };
            let _ = result;
        }

        if transport_failed {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.mark_for_removal();
            }
        }
    }

    fn do_output_for(&mut self, session_id: SessionId, max_bytes: usize) {
        let mut bytes_written = 0usize;
        let mut transport_failed = false;

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let (Some(io), Some(gateway)) = (session.data_io_mut(), session.gateway_mut()) {
                match gateway.do_output(io.as_mut(), max_bytes) {
                    Ok(n) => bytes_written = n,
                    Err(MuscleError::TransportFailed(e)) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(_) => transport_failed = true,
                }
            }
        }

        if let Some(pid) = self.sessions.get(&session_id).and_then(|s| s.output_policy) {
            if let Some(p) = self.policies.get_mut(pid) {
                p.bytes_transferred(PolicyHolder { session: session_id, is_input: false }, bytes_written as u32);
            }
        }

        if transport_failed {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.mark_for_removal();
            }
        }
    }

    fn drain_signals(&mut self) {
        let signals = match &mut self.signal_pipe {
            Some(pipe) => crate::signal::drain_signal_pipe(pipe.io.as_mut()).unwrap_or_default(),
            None => Vec::new(),
        };
        for sig in signals {
            info!("signal {} received, requesting shutdown", sig);
            self.request_shutdown();
        }
    }

    /// Schedules a reconnect attempt per spec §4.5 (`ClientConnectionClosed`
    /// returning false with a non-`NEVER` delay).
    fn schedule_reconnect(&mut self, session_id: SessionId, delay_micros: u64) {
        let at = pulse::now_micros().saturating_add(delay_micros);
        self.pending_reconnects.push(PendingReconnect { at, session: session_id });
    }

    fn fire_due_reconnects(&mut self, now: u64) {
        let due: Vec<SessionId> = {
            let mut due = Vec::new();
            self.pending_reconnects.retain(|r| {
                if r.at <= now {
                    due.push(r.session);
                    false
                } else {
                    true
                }
            });
            due
        };
        for session_id in due {
            self.attempt_reconnect(session_id);
        }
    }

    fn attempt_reconnect(&mut self, session_id: SessionId) {
        let destination = match self.sessions.get(&session_id) {
            Some(session) => session.reconnect.destination.clone(),
            None => return,
        };

        let addr: SocketAddr = match destination.as_deref().and_then(|d| d.parse().ok()) {
            Some(a) => a,
            None => {
                warn!("session {} has no usable reconnect destination", session_id);
                return;
            }
        };

        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = self.alloc_token();
                if self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE).is_ok() {
                    let gateway: Box<dyn Gateway> = Box::new(FramedMessageGateway::new(self.config.max_message_size));
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.attach_gateway(gateway);
                        session.attach_data_io(Box::new(TcpDataIO::new(stream)));
                    }
                    if let Some(meta) = self.session_meta.get_mut(&session_id) {
                        self.tokens.remove(&meta.token);
                        meta.token = token;
                        meta.connecting_since = Some(pulse::now_micros());
                    }
                    self.tokens.insert(token, TokenOwner::Session(session_id));
                }
            }
            Err(e) => {
                debug!("reconnect attempt for session {} failed to start: {}", session_id, e);
                self.schedule_reconnect(session_id, 1_000_000);
            }
        }
    }

    /// Spec §4.7 step 9: sessions whose `ClientConnectionClosed` returned
    /// true, or that called `EndSession` (i.e. `mark_for_removal`), have
    /// their home subtree destroyed and are then deleted. A session
    /// stuck past `maxAsyncConnectPeriod` mid-reconnect is also removed.
    fn run_deferred_removal(&mut self) -> io::Result<()> {
        let now = pulse::now_micros();
        let mut to_remove = Vec::new();

        for (&id, session) in self.sessions.iter_mut() {
            if session.is_marked_for_removal() {
                to_remove.push(id);
                continue;
            }
            if let Some(since) = self.session_meta.get(&id).and_then(|m| m.connecting_since) {
                let max_period = session.reconnect.max_async_connect_period_micros;
                if max_period != NEVER && now.saturating_sub(since) > max_period {
                    to_remove.push(id);
                }
            }
        }

        for id in to_remove {
            let accept_removal = self.sessions.get_mut(&id).map(|s| s.client_connection_closed()).unwrap_or(true);

            if accept_removal {
                self.detach_session(id)?;
            } else {
                let delay = self.sessions.get(&id).map(|s| s.reconnect.delay_micros).unwrap_or(NEVER);
                if delay != NEVER {
                    self.schedule_reconnect(id, delay);
                } else {
                    self.detach_session(id)?;
                }
            }
        }
        Ok(())
    }

    /// Handles the three commands that need factory-level state
    /// (`PR_COMMAND_ADDBANS`/`REMOVEBANS`/`KICK`) before falling back to
    /// `reflect::handle_command` for everything else (spec §4.6).
    /// `privall` exempts a client from every one of these checks.
    pub fn dispatch_privileged_command(&mut self, from: SessionId, msg: &Message) -> MuscleResult<()> {
        let client_address = self.session_meta.get(&from).map(|m| m.client_address.clone()).unwrap_or_default();
        if self.config.priv_all_patterns.iter().any(|p| crate::path::clause_matches(p, &client_address)) {
            // exempt
        } else {
            let specific = match msg.what {
                what::PR_COMMAND_KICK => &self.config.priv_kick_patterns,
                what::PR_COMMAND_ADDBANS => &self.config.priv_ban_patterns,
                what::PR_COMMAND_REMOVEBANS => &self.config.priv_unban_patterns,
                _ => return Err(permission_denied("not a privileged command")),
            };
            reflect::check_privilege(specific, &client_address)?;
        }

        match msg.what {
            what::PR_COMMAND_KICK => {
                if let Some(target) = msg.find_string("target", 0) {
                    let matching_id = self
                        .session_meta
                        .iter()
                        .find(|(_, m)| m.client_address == target)
                        .map(|(&id, _)| id);
                    if let Some(id) = matching_id {
                        if let Some(session) = self.sessions.get_mut(&id) {
                            session.mark_for_removal();
                        }
                    }
                }
                Ok(())
            }
            what::PR_COMMAND_ADDBANS => {
                for pattern in reflect::keys_of(msg) {
                    for entry in self.factories.values_mut() {
                        entry.factory.add_ban(&pattern);
                    }
                }
                Ok(())
            }
            what::PR_COMMAND_REMOVEBANS => {
                for pattern in reflect::keys_of(msg) {
                    for entry in self.factories.values_mut() {
                        entry.factory.remove_ban(&pattern);
                    }
                }
                Ok(())
            }
            _ => Err(permission_denied("not a privileged command")),
        }
    }
}

fn cap_for(policies: &mut [Box<dyn Policy>], policy_id: Option<PolicyId>, session_id: SessionId, is_input: bool) -> usize {
    let pid = match policy_id {
        Some(pid) => pid,
        None => return UNTHROTTLED_CHUNK,
    };
    match policies.get_mut(pid) {
        Some(policy) => {
            let holder = PolicyHolder { session: session_id, is_input };
            if policy.okay_to_transfer(holder) {
                policy.get_max_transfer_chunk_size(holder) as usize
            } else {
                0
            }
        }
        None => UNTHROTTLED_CHUNK,
    }
}

fn pulse_timeout(earliest: u64, now: u64) -> Option<Duration> {
    if earliest == NEVER {
        None
    } else {
        let micros = earliest.saturating_sub(now);
        Some(Duration::from_micros(micros))
    }
}
