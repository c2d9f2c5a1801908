// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Concrete `DataIO` transports: TCP and UDP sockets wired through `mio`.
//! Spec §6 treats the transport as an external collaborator behind the
//! `DataIO` trait (spec §4.3); this module provides the two the framed
//! TCP protocol and UDP path actually need, replacing the teacher's
//! nanomsg pipe/handshake state machine (`StepStream`, `PipeState`) with
//! direct non-blocking reads/writes, since MUSCLE's gateway already owns
//! framing and there is no handshake to perform at this layer.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpStream, UdpSocket, UnixStream};

use crate::gateway::DataIO;
use crate::global::other_io_error;

/// Wraps a connected, non-blocking `mio::net::TcpStream`.
pub struct TcpDataIO {
    stream: TcpStream,
}

impl TcpDataIO {
    pub fn new(stream: TcpStream) -> TcpDataIO {
        TcpDataIO { stream }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn mio_source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl DataIO for TcpDataIO {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
}

/// A UDP socket, per spec §6 ("UDP is supported only at the DataIO
/// level; each datagram carries one framed Message"). `peer` is the most
/// recently observed sender, used as the implicit destination for
/// outgoing datagrams when none was set explicitly (e.g. a server
/// replying to the last client that wrote to it).
pub struct UdpDataIO {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpDataIO {
    pub fn new(socket: UdpSocket, peer: Option<SocketAddr>) -> UdpDataIO {
        UdpDataIO { socket, peer }
    }

    pub fn mio_source(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }
}

impl DataIO for UdpDataIO {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, from) = self.socket.recv_from(buf)?;
        self.peer = Some(from);
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.peer {
            Some(addr) => self.socket.send_to(buf, addr),
            None => Err(other_io_error("no destination address for UDP datagram")),
        }
    }
}

/// The self-pipe end the signal-handler session (spec §4.9) reads from.
/// A plain `mio::net::UnixStream` pair, one half registered with the
/// event loop and the other written to from the process's real signal
/// handler (outside this crate's scope, see `signal.rs`).
pub struct UnixDataIO {
    stream: UnixStream,
}

impl UnixDataIO {
    pub fn new(stream: UnixStream) -> UnixDataIO {
        UnixDataIO { stream }
    }

    pub fn mio_source(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}

impl DataIO for UnixDataIO {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
}
