// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The pulse scheduler: a tree of timer nodes with earliest-deadline
//! dispatch. See spec §4.4. The three sibling lists (scheduled,
//! unscheduled, needs-recalc) from the design are kept verbatim as the
//! algorithm's heart; back-pointers are slab indices rather than raw
//! pointers, per the design notes on severing ownership cycles.

use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel meaning "never scheduled".
pub const NEVER: u64 = u64::MAX;

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Implemented by anything that participates in the pulse tree: the
/// server itself, sessions, factories, and bandwidth policies.
pub trait PulseCallback {
    /// Returns the absolute time (microseconds) this node next wants to be
    /// pulsed, or [`NEVER`]. `prev_scheduled` is whatever this method
    /// previously returned, so an implementation can detect "nothing
    /// changed" cheaply.
    fn get_pulse_time(&mut self, _call_time: u64, _prev_scheduled: u64) -> u64 {
        NEVER
    }

    /// Invoked once `call_time >= scheduled_time`.
    fn pulse(&mut self, _call_time: u64, _scheduled_time: u64) {}
}

pub type PulseId = usize;
const ROOT: PulseId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SiblingList {
    Scheduled,
    Unscheduled,
    NeedsRecalc,
}

struct Slot {
    parent: Option<PulseId>,
    list: Option<SiblingList>,
    scheduled: [Vec<PulseId>; 3],
    scheduled_time: u64,
    scheduled_time_valid: bool,
    aggregate_time: u64,
    callback: Box<dyn PulseCallback>,
    alive: bool,
}

fn list_index(list: SiblingList) -> usize {
    match list {
        SiblingList::Scheduled => 0,
        SiblingList::Unscheduled => 1,
        SiblingList::NeedsRecalc => 2,
    }
}

/// The pulse tree. Node 0 is always the root (typically the reflect
/// server itself); every other node is reached only through its parent.
pub struct PulseTree {
    slots: Vec<Slot>,
}

impl PulseTree {
    pub fn new(root_callback: Box<dyn PulseCallback>) -> PulseTree {
        PulseTree {
            slots: vec![Slot {
                parent: None,
                list: None,
                scheduled: [Vec::new(), Vec::new(), Vec::new()],
                scheduled_time: NEVER,
                scheduled_time_valid: false,
                aggregate_time: NEVER,
                callback: root_callback,
                alive: true,
            }],
        }
    }

    pub fn root(&self) -> PulseId {
        ROOT
    }

    pub fn add_child(&mut self, parent: PulseId, callback: Box<dyn PulseCallback>) -> PulseId {
        let id = self.slots.len();
        self.slots.push(Slot {
            parent: Some(parent),
            list: None,
            scheduled: [Vec::new(), Vec::new(), Vec::new()],
            scheduled_time: NEVER,
            scheduled_time_valid: false,
            aggregate_time: NEVER,
            callback,
            alive: true,
        });
        self.reschedule(parent, id, Some(SiblingList::NeedsRecalc));
        id
    }

    /// Detaches `id` from its parent. Safe at any time, including mid-pulse.
    pub fn remove(&mut self, id: PulseId) {
        if id == ROOT || !self.slots[id].alive {
            return;
        }
        let parent = self.slots[id].parent;
        if let Some(parent_id) = parent {
            let was_scheduled_head = self.slots[parent_id].scheduled[list_index(SiblingList::Scheduled)]
                .first()
                .copied()
                == Some(id);
            self.unlink(parent_id, id);
            self.slots[id].parent = None;
            self.slots[id].scheduled_time_valid = false;
            if was_scheduled_head {
                if let Some(grandparent) = self.slots[parent_id].parent {
                    self.reschedule(grandparent, parent_id, Some(SiblingList::NeedsRecalc));
                }
            }
        }
        self.slots[id].alive = false;
    }

    pub fn callback_mut(&mut self, id: PulseId) -> &mut (dyn PulseCallback + 'static) {
        &mut *self.slots[id].callback
    }

    /// Call when external state may have changed this node's pulse time;
    /// moves it to the owning parent's needs-recalc list.
    pub fn invalidate_pulse_time(&mut self, id: PulseId, clear_prev_result: bool) {
        if !self.slots[id].scheduled_time_valid {
            return;
        }
        self.slots[id].scheduled_time_valid = false;
        if clear_prev_result {
            self.slots[id].scheduled_time = NEVER;
        }
        if let Some(parent) = self.slots[id].parent {
            self.reschedule(parent, id, Some(SiblingList::NeedsRecalc));
        }
    }

    /// Runs one full scheduling pass: recompute invalidated aggregates,
    /// dispatch every due pulse, then recompute aggregates once more so the
    /// returned time reflects pulses just fired. Returns the absolute time
    /// of the next pulse, or [`NEVER`].
    pub fn tick(&mut self, now: u64) -> u64 {
        self.get_pulse_time_aux(ROOT, now);
        self.pulse_aux(ROOT, now);
        self.get_pulse_time_aux(ROOT, now)
    }

    fn get_pulse_time_aux(&mut self, id: PulseId, now: u64) -> u64 {
        if !self.slots[id].scheduled_time_valid {
            self.slots[id].scheduled_time_valid = true;
            let prev = self.slots[id].scheduled_time;
            let new_time = self.slots[id].callback.get_pulse_time(now, prev);
            self.slots[id].scheduled_time = new_time;
        }

        loop {
            let needy = self.slots[id].scheduled[list_index(SiblingList::NeedsRecalc)]
                .first()
                .copied();
            match needy {
                Some(child_id) => {
                    self.get_pulse_time_aux(child_id, now);
                }
                None => break,
            }
        }

        let old_aggregate = self.slots[id].aggregate_time;
        let first_scheduled_child_time = self.slots[id].scheduled[list_index(SiblingList::Scheduled)]
            .first()
            .map(|child_id| self.slots[*child_id].aggregate_time)
            .unwrap_or(NEVER);
        let new_aggregate = self.slots[id].scheduled_time.min(first_scheduled_child_time);
        self.slots[id].aggregate_time = new_aggregate;

        if let Some(parent) = self.slots[id].parent {
            let currently_needs_recalc = self.slots[id].list == Some(SiblingList::NeedsRecalc);
            if currently_needs_recalc || new_aggregate != old_aggregate {
                let target = if new_aggregate == NEVER {
                    SiblingList::Unscheduled
                } else {
                    SiblingList::Scheduled
                };
                self.reschedule(parent, id, Some(target));
            }
        }

        new_aggregate
    }

    fn pulse_aux(&mut self, id: PulseId, now: u64) {
        if self.slots[id].scheduled_time_valid && now >= self.slots[id].scheduled_time {
            let scheduled_time = self.slots[id].scheduled_time;
            self.slots[id].callback.pulse(now, scheduled_time);
            self.slots[id].scheduled_time_valid = false;
        }

        loop {
            let head = self.slots[id].scheduled[list_index(SiblingList::Scheduled)]
                .first()
                .copied();
            match head {
                Some(child_id) if self.slots[child_id].aggregate_time <= now => {
                    self.pulse_aux(child_id, now);
                }
                _ => break,
            }
        }

        if let Some(parent) = self.slots[id].parent {
            self.reschedule(parent, id, Some(SiblingList::NeedsRecalc));
        }
    }

    fn unlink(&mut self, parent: PulseId, child: PulseId) {
        if let Some(list) = self.slots[child].list {
            let idx = list_index(list);
            self.slots[parent].scheduled[idx].retain(|&c| c != child);
        }
        self.slots[child].list = None;
    }

    /// Mirrors `PulseNode::ReschedulePulseChild`: moves `child` (owned by
    /// `parent`) into `target`, recursing into the needs-recalc case which
    /// also bubbles the parent's own membership upward.
    fn reschedule(&mut self, parent: PulseId, child: PulseId, target: Option<SiblingList>) {
        let current = self.slots[child].list;
        if current == target && current != Some(SiblingList::Scheduled) {
            return;
        }

        self.unlink(parent, child);
        self.slots[child].list = target;

        match target {
            None => {}
            Some(SiblingList::Scheduled) => self.insert_sorted(parent, child),
            Some(SiblingList::NeedsRecalc) => {
                if let Some(grandparent) = self.slots[parent].parent {
                    self.reschedule(grandparent, parent, Some(SiblingList::NeedsRecalc));
                }
                self.slots[parent].scheduled[list_index(SiblingList::NeedsRecalc)].insert(0, child);
            }
            Some(SiblingList::Unscheduled) => {
                self.slots[parent].scheduled[list_index(SiblingList::Unscheduled)].insert(0, child);
            }
        }
    }

    fn insert_sorted(&mut self, parent: PulseId, child: PulseId) {
        let child_time = self.slots[child].aggregate_time;
        let idx = list_index(SiblingList::Scheduled);

        let tail_time = self.slots[parent].scheduled[idx]
            .last()
            .map(|&t| self.slots[t].aggregate_time);

        let insert_pos = match tail_time {
            Some(tail_time) if child_time >= tail_time => None, // append
            _ => {
                let list = &self.slots[parent].scheduled[idx];
                Some(
                    list.iter()
                        .position(|&n| self.slots[n].aggregate_time >= child_time)
                        .unwrap_or(list.len()),
                )
            }
        };

        let list = &mut self.slots[parent].scheduled[idx];
        match insert_pos {
            None => list.push(child),
            Some(pos) => list.insert(pos, child),
        }
    }

    pub fn aggregate_time(&self, id: PulseId) -> u64 {
        self.slots[id].aggregate_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Once {
        at: u64,
        fired: Rc<RefCell<Vec<u64>>>,
        done: bool,
    }

    impl PulseCallback for Once {
        fn get_pulse_time(&mut self, _now: u64, _prev: u64) -> u64 {
            if self.done {
                NEVER
            } else {
                self.at
            }
        }

        fn pulse(&mut self, call_time: u64, _scheduled: u64) {
            self.done = true;
            self.fired.borrow_mut().push(call_time);
        }
    }

    #[test]
    fn fires_exactly_once_when_due() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut tree = PulseTree::new(Box::new(Once { at: NEVER, fired: fired.clone(), done: true }));
        let child = tree.add_child(tree.root(), Box::new(Once { at: 100, fired: fired.clone(), done: false }));

        let next = tree.tick(50);
        assert_eq!(next, 100);
        assert!(fired.borrow().is_empty());

        let next = tree.tick(100);
        assert_eq!(fired.borrow().as_slice(), &[100]);
        assert_eq!(next, NEVER);

        tree.remove(child);
    }

    #[test]
    fn earliest_child_drives_aggregate() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut tree = PulseTree::new(Box::new(Once { at: NEVER, fired: fired.clone(), done: true }));
        let _a = tree.add_child(tree.root(), Box::new(Once { at: 500, fired: fired.clone(), done: false }));
        let _b = tree.add_child(tree.root(), Box::new(Once { at: 200, fired: fired.clone(), done: false }));

        let next = tree.tick(0);
        assert_eq!(next, 200);
    }

    #[test]
    fn removed_node_never_fires() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut tree = PulseTree::new(Box::new(Once { at: NEVER, fired: fired.clone(), done: true }));
        let child = tree.add_child(tree.root(), Box::new(Once { at: 100, fired: fired.clone(), done: false }));
        tree.tick(0);
        tree.remove(child);
        tree.tick(1000);
        assert!(fired.borrow().is_empty());
    }
}
