// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The bandwidth-policy interface and the canonical rate-limiter. See
//! spec §4.8. Ported directly from the aggregate-tally algorithm in
//! MUSCLE's `RateLimitSessionIOPolicy`.

use crate::pulse::{PulseCallback, NEVER};
use crate::session::SessionId;

/// Index into the reflect server's slab of bandwidth policies.
pub type PolicyId = usize;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// A (session, direction) pair registered with a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyHolder {
    pub session: SessionId,
    pub is_input: bool,
}

pub trait BandwidthPolicy {
    fn policy_holder_added(&mut self, _holder: PolicyHolder) {}
    fn policy_holder_removed(&mut self, _holder: PolicyHolder) {}

    fn begin_io(&mut self, now: u64);
    fn end_io(&mut self, now: u64);

    fn okay_to_transfer(&mut self, holder: PolicyHolder) -> bool;
    fn get_max_transfer_chunk_size(&self, holder: PolicyHolder) -> u32;
    fn bytes_transferred(&mut self, holder: PolicyHolder, num_bytes: u32);
}

/// The canonical rate-limiter: tallies bytes transferred and decays the
/// tally at `max_rate` bytes/sec of wall-clock time.
pub struct RateLimiter {
    max_rate: u32,
    byte_limit: u32,
    last_transfer_at: u64,
    transfer_tally: u64,
    num_participants: u32,
}

impl RateLimiter {
    /// `byte_limit` defaults to `max_rate` itself if zero is passed, per
    /// the original's `primeBytes` default.
    pub fn new(max_rate: u32, byte_limit: u32) -> RateLimiter {
        RateLimiter {
            max_rate,
            byte_limit: if byte_limit == 0 { max_rate } else { byte_limit },
            last_transfer_at: 0,
            transfer_tally: 0,
            num_participants: 0,
        }
    }

    fn cutoff(&self) -> u64 {
        self.byte_limit as u64 / 2
    }

    fn update_transfer_tally(&mut self, now: u64) {
        if self.max_rate > 0 {
            let new_bytes_available = if self.last_transfer_at > 0 {
                ((now.saturating_sub(self.last_transfer_at)) as u128 * self.max_rate as u128
                    / MICROS_PER_SECOND as u128) as u64
            } else {
                u64::MAX
            };
            self.transfer_tally = self.transfer_tally.saturating_sub(new_bytes_available);
        } else {
            self.transfer_tally = u64::MAX;
        }
    }
}

impl BandwidthPolicy for RateLimiter {
    fn begin_io(&mut self, now: u64) {
        self.update_transfer_tally(now);
        self.last_transfer_at = now;
        self.num_participants = 0;
    }

    fn end_io(&mut self, _now: u64) {}

    fn okay_to_transfer(&mut self, _holder: PolicyHolder) -> bool {
        if self.max_rate > 0 && self.transfer_tally < self.cutoff() {
            self.num_participants += 1;
            true
        } else {
            false
        }
    }

    fn get_max_transfer_chunk_size(&self, _holder: PolicyHolder) -> u32 {
        if self.num_participants == 0 {
            return 0;
        }
        if self.transfer_tally < self.byte_limit as u64 {
            ((self.byte_limit as u64 - self.transfer_tally) / self.num_participants as u64) as u32
        } else {
            0
        }
    }

    fn bytes_transferred(&mut self, _holder: PolicyHolder, num_bytes: u32) {
        self.transfer_tally += num_bytes as u64;
    }
}

impl PulseCallback for RateLimiter {
    fn get_pulse_time(&mut self, call_time: u64, _prev_scheduled: u64) -> u64 {
        if self.max_rate > 0 && self.transfer_tally >= self.cutoff() {
            call_time + (self.transfer_tally * MICROS_PER_SECOND / self.max_rate as u64)
        } else {
            NEVER
        }
    }

    fn pulse(&mut self, call_time: u64, _scheduled_time: u64) {
        self.update_transfer_tally(call_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(id: u32) -> PolicyHolder {
        PolicyHolder { session: SessionId(id), is_input: false }
    }

    #[test]
    fn allows_transfer_under_cutoff() {
        let mut rl = RateLimiter::new(1024, 0);
        rl.begin_io(0);
        assert!(rl.okay_to_transfer(holder(1)));
        assert_eq!(rl.get_max_transfer_chunk_size(holder(1)), 1024);
    }

    #[test]
    fn blocks_transfer_once_tally_passes_cutoff() {
        let mut rl = RateLimiter::new(1000, 1000);
        rl.begin_io(0);
        assert!(rl.okay_to_transfer(holder(1)));
        rl.bytes_transferred(holder(1), 600);
        rl.end_io(0);

        rl.begin_io(0);
        assert!(!rl.okay_to_transfer(holder(1)));
    }

    #[test]
    fn tally_decays_with_elapsed_time() {
        let mut rl = RateLimiter::new(1000, 1000);
        rl.begin_io(0);
        rl.bytes_transferred(holder(1), 900);
        rl.end_io(0);

        // one second later the whole 1000 B/s budget should have decayed back
        rl.begin_io(MICROS_PER_SECOND);
        assert!(rl.okay_to_transfer(holder(1)));
        assert_eq!(rl.get_max_transfer_chunk_size(holder(1)), 1000);
    }

    #[test]
    fn max_transfer_chunk_splits_across_participants() {
        let mut rl = RateLimiter::new(1000, 1000);
        rl.begin_io(0);
        assert!(rl.okay_to_transfer(holder(1)));
        assert!(rl.okay_to_transfer(holder(2)));
        assert_eq!(rl.get_max_transfer_chunk_size(holder(1)), 500);
    }

    #[test]
    fn schedules_pulse_when_above_cutoff() {
        let mut rl = RateLimiter::new(1000, 1000);
        rl.begin_io(0);
        rl.bytes_transferred(holder(1), 600);
        rl.end_io(0);
        let pulse_time = rl.get_pulse_time(0, NEVER);
        assert_eq!(pulse_time, 600_000); // 600 bytes / 1000 B/s == 0.6s == 600_000us
    }
}
