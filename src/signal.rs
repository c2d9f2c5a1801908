// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The signal-handler session's pipe protocol (spec §4.9). A real OS
//! signal handler may only write to an already-open file descriptor; it
//! writes one fixed-size record per signal and the event loop decodes
//! whatever arrived since the last read. Ported from
//! `original_source/reflector/SignalHandlerSession.h`'s
//! `SignalEventInfo`, simplified per the design notes to a bare `u32`
//! signal number with no accompanying PID field.

use std::io;

use crate::gateway::DataIO;

pub const SIGNAL_RECORD_LEN: usize = 4;

/// Encodes one signal-number record, little-endian. Intended for use
/// from the write end of the self-pipe, which in a real deployment is
/// written from a `signal()`/`sigaction()` handler installed by the
/// embedding application.
pub fn encode_signal_record(signal_number: u32) -> [u8; SIGNAL_RECORD_LEN] {
    signal_number.to_le_bytes()
}

/// Decodes as many complete records as `buf` holds. A trailing partial
/// record is simply not returned; `drain_signal_pipe` carries it over to
/// the next read via its own leftover buffer.
fn decode_signal_records(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(SIGNAL_RECORD_LEN)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Reads whatever is currently available from the signal pipe and
/// returns every complete signal-number record decoded so far. The
/// reflect server's default reaction to each one is `request_shutdown`
/// (spec §4.9's "EndServer() by default"); an embedding application
/// wanting different behavior per signal number can inspect the
/// returned values itself before calling into the server.
pub fn drain_signal_pipe(io: &mut dyn DataIO) -> io::Result<Vec<u32>> {
    let mut chunk = [0u8; 256];
    let mut leftover: Vec<u8> = Vec::new();
    let mut signals = Vec::new();

    loop {
        match io.try_read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                leftover.extend_from_slice(&chunk[..n]);
                let complete_len = leftover.len() - (leftover.len() % SIGNAL_RECORD_LEN);
                signals.extend(decode_signal_records(&leftover[..complete_len]));
                leftover.drain(0..complete_len);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct LoopbackIO {
        to_read: VecDeque<u8>,
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
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
            } else {
                Ok(n)
            }
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn decodes_a_single_signal_record() {
        let mut io = LoopbackIO::default();
        io.to_read.extend(encode_signal_record(15));
        let signals = drain_signal_pipe(&mut io).unwrap();
        assert_eq!(signals, vec![15]);
    }

    #[test]
    fn decodes_multiple_back_to_back_records() {
        let mut io = LoopbackIO::default();
        io.to_read.extend(encode_signal_record(2));
        io.to_read.extend(encode_signal_record(15));
        let signals = drain_signal_pipe(&mut io).unwrap();
        assert_eq!(signals, vec![2, 15]);
    }

    #[test]
    fn empty_pipe_yields_no_signals() {
        let mut io = LoopbackIO::default();
        assert!(drain_signal_pipe(&mut io).unwrap().is_empty());
    }
}
