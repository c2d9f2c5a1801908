// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! I/O gateways: frame outgoing Messages onto a byte-stream `DataIO` and
//! decode incoming bytes back into Messages. See spec §4.3.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec;
use crate::error::{malformed, MuscleResult};
use crate::message::{what, Message};

/// A byte-stream transport, narrowed to the two operations a gateway
/// needs. TCP/UDP sockets and the in-process test double both implement
/// this; see `transport.rs`.
pub trait DataIO {
    /// Non-blocking read. `Err(WouldBlock)` means "no bytes available
    /// right now", not a failure.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Non-blocking write. `Err(WouldBlock)` means "the socket send
    /// buffer is full right now".
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

pub trait GatewayMessageReceiver {
    fn message_received_from_gateway(&mut self, msg: Rc<Message>);
}

/// Encoding byte carried in the framed-message gateway's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Uncompressed = 1,
    #[cfg(feature = "zlib")]
    ZlibDeflated = 2,
}

pub trait Gateway {
    fn add_outgoing_message(&mut self, msg: Rc<Message>);
    fn has_bytes_to_output(&self) -> bool;
    fn is_ready_for_input(&self) -> bool;

    /// Drops any not-yet-encoded outgoing Message for which `keep`
    /// returns `false`. Used by `PR_COMMAND_JETTISON` to cancel queued
    /// notifications that haven't hit the wire yet; a Message already
    /// partway through encoding is unaffected. Default no-op so gateways
    /// that don't queue ahead of encoding (none currently) need not
    /// implement it.
    fn retain_outgoing_messages(&mut self, _keep: &dyn Fn(&Message) -> bool) {}

    fn do_input(
        &mut self,
        io: &mut dyn DataIO,
        max_bytes: usize,
        receiver: &mut dyn GatewayMessageReceiver,
    ) -> MuscleResult<usize>;

    fn do_output(&mut self, io: &mut dyn DataIO, max_bytes: usize) -> MuscleResult<usize>;
}

/// Frames each outgoing Message as `[u32 bodyLen][u32 encoding][body]`.
pub struct FramedMessageGateway {
    outgoing: VecDeque<Rc<Message>>,
    output_buffer: Vec<u8>,
    output_offset: usize,
    incoming_buffer: Vec<u8>,
    max_incoming_message_size: Option<u32>,
    encoding: Encoding,
    fatal: bool,
}

impl FramedMessageGateway {
    pub fn new(max_incoming_message_size: Option<u32>) -> FramedMessageGateway {
        FramedMessageGateway {
            outgoing: VecDeque::new(),
            output_buffer: Vec::new(),
            output_offset: 0,
            incoming_buffer: Vec::new(),
            max_incoming_message_size,
            encoding: Encoding::Uncompressed,
            fatal: false,
        }
    }

    fn encode_next_message(&mut self) -> MuscleResult<()> {
        if let Some(msg) = self.outgoing.pop_front() {
            let body = codec::flatten(&msg)?;
            let mut framed = Vec::with_capacity(8 + body.len());
            let mut header = [0u8; 8];
            LittleEndian::write_u32(&mut header[0..4], body.len() as u32);
            LittleEndian::write_u32(&mut header[4..8], self.encoding as u32);
            framed.extend_from_slice(&header);
            framed.extend_from_slice(&body);

            self.output_buffer = framed;
            self.output_offset = 0;
        }
        Ok(())
    }

    /// Attempts to parse as many complete frames as currently buffered,
    /// handing each decoded Message to `receiver`.
    fn drain_complete_frames(&mut self, receiver: &mut dyn GatewayMessageReceiver) -> MuscleResult<()> {
        loop {
            if self.incoming_buffer.len() < 8 {
                return Ok(());
            }
            let body_len = LittleEndian::read_u32(&self.incoming_buffer[0..4]) as usize;
            let encoding = LittleEndian::read_u32(&self.incoming_buffer[4..8]);

            if let Some(max) = self.max_incoming_message_size {
                if body_len as u32 > max {
                    self.fatal = true;
                    return Err(malformed("incoming frame exceeds configured max message size"));
                }
            }

            if self.incoming_buffer.len() < 8 + body_len {
                return Ok(());
            }

            let body = self.incoming_buffer[8..8 + body_len].to_vec();
            self.incoming_buffer.drain(0..8 + body_len);

            let decoded = decode_body(encoding, &body)?;
            receiver.message_received_from_gateway(decoded);
        }
    }
}

#[cfg(feature = "zlib")]
fn decode_body(encoding: u32, body: &[u8]) -> MuscleResult<Rc<Message>> {
    if encoding == Encoding::ZlibDeflated as u32 {
        use std::io::Read;
        let mut inflater = flate2::read::ZlibDecoder::new(body);
        let mut inflated = Vec::new();
        inflater
            .read_to_end(&mut inflated)
            .map_err(|_| malformed("zlib inflate failed"))?;
        codec::unflatten(&inflated)
    } else {
        codec::unflatten(body)
    }
}

#[cfg(not(feature = "zlib"))]
fn decode_body(encoding: u32, body: &[u8]) -> MuscleResult<Rc<Message>> {
    if encoding != Encoding::Uncompressed as u32 {
        return Err(malformed("zlib-encoded frame received but the zlib feature is disabled"));
    }
    codec::unflatten(body)
}

impl Gateway for FramedMessageGateway {
    fn add_outgoing_message(&mut self, msg: Rc<Message>) {
        self.outgoing.push_back(msg);
    }

    fn has_bytes_to_output(&self) -> bool {
        !self.outgoing.is_empty() || self.output_offset < self.output_buffer.len()
    }

    fn is_ready_for_input(&self) -> bool {
        !self.fatal
    }

    fn retain_outgoing_messages(&mut self, keep: &dyn Fn(&Message) -> bool) {
        self.outgoing.retain(|msg| keep(msg));
    }

    fn do_input(
        &mut self,
        io: &mut dyn DataIO,
        max_bytes: usize,
        receiver: &mut dyn GatewayMessageReceiver,
    ) -> MuscleResult<usize> {
        let mut total = 0usize;
        let mut chunk = vec![0u8; 4096.min(max_bytes.max(1))];

        while total < max_bytes {
            let want = (max_bytes - total).min(chunk.len());
            match io.try_read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    self.incoming_buffer.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.drain_complete_frames(receiver)?;
        Ok(total)
    }

    fn do_output(&mut self, io: &mut dyn DataIO, max_bytes: usize) -> MuscleResult<usize> {
        let mut total = 0usize;

        while total < max_bytes {
            if self.output_offset >= self.output_buffer.len() {
                self.encode_next_message()?;
                if self.output_buffer.is_empty() {
                    break;
                }
            }

            let remaining = &self.output_buffer[self.output_offset..];
            let want = remaining.len().min(max_bytes - total);
            match io.try_write(&remaining[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    self.output_offset += n;
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(total)
    }
}

/// Line-oriented gateway: outgoing Messages are written as the string
/// value of their `text` field followed by `\n`; incoming lines become a
/// Message with a single `text` field.
pub struct PlainTextGateway {
    outgoing: VecDeque<Rc<Message>>,
    output_buffer: Vec<u8>,
    output_offset: usize,
    incoming_buffer: Vec<u8>,
}

impl PlainTextGateway {
    pub fn new() -> PlainTextGateway {
        PlainTextGateway {
            outgoing: VecDeque::new(),
            output_buffer: Vec::new(),
            output_offset: 0,
            incoming_buffer: Vec::new(),
        }
    }

    fn encode_next_line(&mut self) {
        if let Some(msg) = self.outgoing.pop_front() {
            let text = msg.find_string("text", 0).unwrap_or("");
            let mut line = text.as_bytes().to_vec();
            line.push(b'\n');
            self.output_buffer = line;
            self.output_offset = 0;
        }
    }

    fn drain_complete_lines(&mut self, receiver: &mut dyn GatewayMessageReceiver) {
        while let Some(pos) = self.incoming_buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.incoming_buffer.drain(0..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
            let mut msg = Message::new(what::PR_RESULT_DATAITEMS);
            msg.add_string("text", line);
            receiver.message_received_from_gateway(Rc::new(msg));
        }
    }
}

impl Default for PlainTextGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for PlainTextGateway {
    fn add_outgoing_message(&mut self, msg: Rc<Message>) {
        self.outgoing.push_back(msg);
    }

    fn has_bytes_to_output(&self) -> bool {
        !self.outgoing.is_empty() || self.output_offset < self.output_buffer.len()
    }

    fn is_ready_for_input(&self) -> bool {
        true
    }

    fn retain_outgoing_messages(&mut self, keep: &dyn Fn(&Message) -> bool) {
        self.outgoing.retain(|msg| keep(msg));
    }

    fn do_input(
        &mut self,
        io: &mut dyn DataIO,
        max_bytes: usize,
        receiver: &mut dyn GatewayMessageReceiver,
    ) -> MuscleResult<usize> {
        let mut total = 0usize;
        let mut chunk = vec![0u8; 4096.min(max_bytes.max(1))];

        while total < max_bytes {
            let want = (max_bytes - total).min(chunk.len());
            match io.try_read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    self.incoming_buffer.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.drain_complete_lines(receiver);
        Ok(total)
    }

    fn do_output(&mut self, io: &mut dyn DataIO, max_bytes: usize) -> MuscleResult<usize> {
        let mut total = 0usize;

        while total < max_bytes {
            if self.output_offset >= self.output_buffer.len() {
                self.encode_next_line();
                if self.output_buffer.is_empty() {
                    break;
                }
            }

            let remaining = &self.output_buffer[self.output_offset..];
            let want = remaining.len().min(max_bytes - total);
            match io.try_write(&remaining[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    self.output_offset += n;
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as Queue;

    /// An in-memory `DataIO` double, modeled on a pair of byte queues.
    #[derive(Default)]
    struct LoopbackIO {
        to_read: Queue<u8>,
        written: Vec<u8>,
    }

    impl DataIO for LoopbackIO {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.to_read.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 && !buf.is_empty() {
                Err(io::Error::new(ErrorKind::WouldBlock, "no data"))
            } else {
                Ok(n)
            }
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    struct Collector {
        received: Vec<Rc<Message>>,
    }

    impl GatewayMessageReceiver for Collector {
        fn message_received_from_gateway(&mut self, msg: Rc<Message>) {
            self.received.push(msg);
        }
    }

    #[test]
    fn framed_gateway_round_trips_a_message() {
        let mut gw = FramedMessageGateway::new(None);
        let mut msg = Message::new(7);
        msg.add_i32("x", 42);
        gw.add_outgoing_message(Rc::new(msg));

        let mut io = LoopbackIO::default();
        gw.do_output(&mut io, 4096).unwrap();

        io.to_read.extend(io.written.iter().copied());
        let mut other_gw = FramedMessageGateway::new(None);
        let mut collector = Collector { received: Vec::new() };
        other_gw.do_input(&mut io, 4096, &mut collector).unwrap();

        assert_eq!(collector.received.len(), 1);
        assert_eq!(collector.received[0].find_i32("x", 0), Some(42));
    }

    #[test]
    fn framed_gateway_rejects_oversized_frame() {
        let mut gw = FramedMessageGateway::new(None);
        let mut msg = Message::new(1);
        msg.add_bytes("blob", vec![0u8; 1024]);
        gw.add_outgoing_message(Rc::new(msg));

        let mut io = LoopbackIO::default();
        gw.do_output(&mut io, 8192).unwrap();

        io.to_read.extend(io.written.iter().copied());
        let mut small_gw = FramedMessageGateway::new(Some(16));
        let mut collector = Collector { received: Vec::new() };
        assert!(small_gw.do_input(&mut io, 8192, &mut collector).is_err());
        assert!(!small_gw.is_ready_for_input());
    }

    #[test]
    fn plain_text_gateway_splits_on_newlines() {
        let mut gw = PlainTextGateway::new();
        let mut io = LoopbackIO::default();
        io.to_read.extend(b"hello\nworld\n".iter().copied());

        let mut collector = Collector { received: Vec::new() };
        gw.do_input(&mut io, 4096, &mut collector).unwrap();

        assert_eq!(collector.received.len(), 2);
        assert_eq!(collector.received[0].find_string("text", 0), Some("hello"));
        assert_eq!(collector.received[1].find_string("text", 0), Some("world"));
    }

    #[test]
    fn plain_text_gateway_writes_text_field_with_newline() {
        let mut gw = PlainTextGateway::new();
        let mut msg = Message::new(0);
        msg.add_string("text", "ping");
        gw.add_outgoing_message(Rc::new(msg));

        let mut io = LoopbackIO::default();
        gw.do_output(&mut io, 4096).unwrap();
        assert_eq!(io.written, b"ping\n");
    }
}
