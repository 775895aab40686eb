//! Scheduler bookkeeping
//!
//! Pure state, no I/O. The queue holds this behind one mutex; every
//! admission decision is a method call on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use futures::future::AbortHandle;
use tokio::sync::oneshot;

use super::priority::{DispatchCandidate, ReadyQueue};
use super::queue::Completion;
use super::request::{Request, RequestId};

/// Where an admitted request is
#[derive(Debug)]
pub(crate) enum Phase {
    /// Waiting for its gates
    Pending,
    /// Handed to the transport
    InFlight(AbortHandle),
}

/// An admitted request
#[derive(Debug)]
pub(crate) struct Entry {
    pub request: Request,
    pub phase: Phase,
    pub completion: Option<oneshot::Sender<Completion>>,
}

/// Why a pending request can't run yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Blocker {
    Group,
    Signal(String),
    CellularSwitch(String),
    OnCellular,
    NotBefore(SystemTime),
}

#[derive(Debug)]
pub(crate) struct AdmissionState {
    entries: BTreeMap<u64, Entry>,
    next_sequence: u64,
    signals: HashSet<String>,
    cellular_switches: HashMap<String, bool>,
    cellular_default: bool,
    on_cellular: bool,
    timer: Option<SystemTime>,
    pub shut_down: bool,
    pub completed: u64,
}

impl AdmissionState {
    pub fn new(cellular_default: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 0,
            signals: HashSet::new(),
            cellular_switches: HashMap::new(),
            cellular_default,
            on_cellular: false,
            timer: None,
            shut_down: false,
            completed: 0,
        }
    }

    /// Admit a request, returning its submission sequence
    pub fn insert(&mut self, request: Request, completion: oneshot::Sender<Completion>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            sequence,
            Entry {
                request,
                phase: Phase::Pending,
                completion: Some(completion),
            },
        );
        sequence
    }

    /// Put a re-issued request back in its original slot.
    ///
    /// Hands the request back when the slot is gone or was cancelled.
    pub fn requeue(&mut self, sequence: u64, request: Request) -> Option<Request> {
        match self.entries.get_mut(&sequence) {
            Some(entry) if !entry.request.is_cancelled() => {
                entry.request = request;
                entry.phase = Phase::Pending;
                None
            }
            _ => Some(request),
        }
    }

    pub fn get(&self, sequence: u64) -> Option<&Entry> {
        self.entries.get(&sequence)
    }

    pub fn get_mut(&mut self, sequence: u64) -> Option<&mut Entry> {
        self.entries.get_mut(&sequence)
    }

    pub fn remove(&mut self, sequence: u64) -> Option<Entry> {
        self.entries.remove(&sequence)
    }

    /// Find by current identifier or by chain lineage
    pub fn find(&self, id: RequestId) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, e)| e.request.id() == id || e.request.lineage() == id)
            .map(|(seq, _)| *seq)
    }

    pub fn is_cancelled(&self, sequence: u64) -> bool {
        self.entries
            .get(&sequence)
            .is_none_or(|e| e.request.is_cancelled())
    }

    pub fn set_signal(&mut self, signal: &str, satisfied: bool) -> bool {
        if satisfied {
            self.signals.insert(signal.to_string())
        } else {
            self.signals.remove(signal)
        }
    }

    pub fn set_cellular_switch(&mut self, switch: &str, allowed: bool) -> bool {
        self.cellular_switches.insert(switch.to_string(), allowed) != Some(allowed)
    }

    pub fn set_on_cellular(&mut self, on_cellular: bool) -> bool {
        std::mem::replace(&mut self.on_cellular, on_cellular) != on_cellular
    }

    /// Identifiers of non-critical requests not yet cancelled
    pub fn non_critical(&self) -> Vec<RequestId> {
        self.entries
            .values()
            .filter(|e| e.request.is_non_critical() && !e.request.is_cancelled())
            .map(|e| e.request.id())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.phase, Phase::InFlight(_)))
            .count()
    }

    pub fn pending(&self) -> usize {
        self.entries.len() - self.in_flight()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// What keeps the pending entry at `sequence` from running
    pub fn blocker(&self, sequence: u64, now: SystemTime) -> Option<Blocker> {
        let entry = self.entries.get(&sequence)?;
        let request = &entry.request;

        if let Some(group) = request.group_id() {
            let ahead = self.entries.iter().any(|(seq, other)| {
                *seq != sequence
                    && other.request.group_id() == Some(group)
                    && (*seq < sequence || matches!(other.phase, Phase::InFlight(_)))
            });
            if ahead {
                return Some(Blocker::Group);
            }
        }
        if let Some(signal) = request
            .required_signals()
            .iter()
            .find(|s| !self.signals.contains(*s))
        {
            return Some(Blocker::Signal(signal.clone()));
        }
        if let Some(switch) = request.required_cellular_switch() {
            let allowed = self
                .cellular_switches
                .get(switch)
                .copied()
                .unwrap_or(self.cellular_default);
            if !allowed {
                return Some(Blocker::CellularSwitch(switch.to_string()));
            }
        }
        if request.avoids_cellular() && self.on_cellular {
            return Some(Blocker::OnCellular);
        }
        match request.earliest_begin() {
            Some(at) if at > now => Some(Blocker::NotBefore(at)),
            _ => None,
        }
    }

    /// Pick requests to dispatch into the free slots.
    ///
    /// Returns their sequences in dispatch order plus the earliest time a
    /// time-gated request becomes runnable.
    pub fn select(&self, now: SystemTime, max_concurrent: usize) -> (Vec<u64>, Option<SystemTime>) {
        let mut ready = ReadyQueue::new();
        let mut wake: Option<SystemTime> = None;
        for (sequence, entry) in &self.entries {
            if !matches!(entry.phase, Phase::Pending) || entry.request.is_cancelled() {
                continue;
            }
            match self.blocker(*sequence, now) {
                None => ready.push(DispatchCandidate::new(*sequence, entry.request.priority())),
                Some(Blocker::NotBefore(at)) => {
                    wake = Some(wake.map_or(at, |w| w.min(at)));
                }
                Some(blocker) => {
                    log::trace!("[queue] {} blocked by {:?}", entry.request.id(), blocker);
                }
            }
        }
        let slots = max_concurrent.saturating_sub(self.in_flight());
        (ready.next_batch(slots), wake)
    }

    /// Mark dispatched, returning the request to hand to the transport
    pub fn start(&mut self, sequence: u64, handle: AbortHandle) -> Option<Request> {
        let entry = self.entries.get_mut(&sequence)?;
        entry.phase = Phase::InFlight(handle);
        Some(entry.request.clone())
    }

    /// Arm the wake-up timer for `at` unless an earlier one is pending
    pub fn arm_timer(&mut self, at: SystemTime) -> bool {
        match self.timer {
            Some(armed) if armed <= at => false,
            _ => {
                self.timer = Some(at);
                true
            }
        }
    }

    pub fn timer_fired(&mut self, at: SystemTime) {
        if self.timer == Some(at) {
            self.timer = None;
        }
    }
}
