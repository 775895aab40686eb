//! Automatic resume after connectivity loss
//!
//! Attempt accounting is keyed by request lineage, so the controller holds no
//! reference to the requests themselves and forgets a chain once it reaches a
//! terminal state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::headers::names;
use super::request::{Method, Request, RequestId};
use crate::utils::{self, NetworkError, StratusError};

/// Opaque resume metadata captured from a failed transfer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumeInfo {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ResumeInfo {
    /// Transport-specific resume blob
    pub const SYSTEM_RESUME_DATA: &'static str = "system-resume-data";
    /// Bytes already written to the destination, decimal
    pub const BYTES_RECEIVED: &'static str = "bytes-received";
    /// Entity tag of the partially received resource
    pub const ENTITY_TAG: &'static str = "entity-tag";

    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata describing a partial download
    pub fn partial(bytes_received: u64, entity_tag: Option<String>) -> Self {
        let mut info = Self::new();
        info.insert(Self::BYTES_RECEIVED, bytes_received.to_string().into_bytes());
        if let Some(tag) = entity_tag {
            info.insert(Self::ENTITY_TAG, tag.into_bytes());
        }
        info
    }

    /// Add an entry, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into this set, `other` wins on conflicts
    pub fn merge(&mut self, other: ResumeInfo) {
        self.entries.extend(other.entries);
    }

    pub fn bytes_received(&self) -> Option<u64> {
        self.get(Self::BYTES_RECEIVED)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| s.parse().ok())
    }

    pub fn entity_tag(&self) -> Option<&str> {
        self.get(Self::ENTITY_TAG)
            .and_then(|raw| std::str::from_utf8(raw).ok())
    }

    /// Whether there is enough here to resume rather than restart
    pub fn can_resume(&self) -> bool {
        self.get(Self::SYSTEM_RESUME_DATA).is_some()
            || self.bytes_received().is_some_and(|n| n > 0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Attempts {
    resumed: bool,
    restarted: bool,
}

/// What to do with a failed request
#[derive(Debug)]
pub enum ResumePlan {
    /// Re-issue from where the transfer stopped
    Resume(Request),
    /// Re-issue from the start
    Restart(Request),
    /// Let the failure stand
    GiveUp,
}

/// Decides whether and how a failed request is retried
#[derive(Debug, Default)]
pub struct ResumeController {
    attempts: Mutex<HashMap<RequestId, Attempts>>,
}

impl ResumeController {
    pub fn new() -> Self {
        Self::default()
    }

    fn eligible(request: &Request, failure: &StratusError) -> bool {
        request.is_auto_resume()
            && !request.is_cancelled()
            && (request.method() == Method::Get || request.is_download())
            && (failure.is_connectivity() || is_rejected_resume(failure))
    }

    /// Whether `failure` on `request` would lead to another attempt
    pub fn should_resume(&self, request: &Request, failure: &StratusError) -> bool {
        if !Self::eligible(request, failure) {
            return false;
        }
        let attempts = utils::lock(&self.attempts)
            .get(&request.lineage())
            .copied()
            .unwrap_or_default();
        if is_rejected_resume(failure) {
            !attempts.restarted
        } else {
            !attempts.resumed && !attempts.restarted
        }
    }

    /// Decide the next step for a failed request, recording the attempt
    pub fn plan(&self, mut request: Request, failure: &StratusError, captured: Option<ResumeInfo>) -> ResumePlan {
        if let Some(captured) = captured {
            let mut info = request.auto_resume_info().cloned().unwrap_or_default();
            info.merge(captured);
            request.set_auto_resume_info(Some(info));
        }
        if !Self::eligible(&request, failure) {
            return ResumePlan::GiveUp;
        }

        let mut attempts = utils::lock(&self.attempts);
        let entry = attempts.entry(request.lineage()).or_default();
        if is_rejected_resume(failure) || !request.auto_resume_info().is_some_and(ResumeInfo::can_resume) {
            if entry.restarted || (entry.resumed && !is_rejected_resume(failure)) {
                return ResumePlan::GiveUp;
            }
            entry.restarted = true;
            drop(attempts);
            log::info!("[resume] restarting {} after {}", request.effective_url(), failure);
            return ResumePlan::Restart(self.restart(request));
        }
        // A resume that is itself interrupted ends the chain; only a refused range restarts
        if entry.resumed || entry.restarted {
            return ResumePlan::GiveUp;
        }
        entry.resumed = true;
        drop(attempts);
        log::info!("[resume] resuming {} after {}", request.effective_url(), failure);
        ResumePlan::Resume(self.prepare_resume(request))
    }

    /// Attach range headers derived from the request's resume metadata
    pub fn prepare_resume(&self, mut request: Request) -> Request {
        let (offset, tag) = match request.auto_resume_info() {
            Some(info) => (info.bytes_received(), info.entity_tag().map(str::to_string)),
            None => (None, None),
        };
        if let Some(offset) = offset {
            request.set_header(names::RANGE, format!("bytes={}-", offset));
            match tag {
                Some(tag) => request.set_header(names::IF_RANGE, tag),
                None => {
                    request.remove_header(names::IF_RANGE);
                }
            }
        }
        request.scrub_for_rescheduling();
        request
    }

    /// Strip resume state so the transfer starts over
    pub fn restart(&self, mut request: Request) -> Request {
        request.set_auto_resume_info(None);
        request.remove_header(names::RANGE);
        request.remove_header(names::IF_RANGE);
        request.scrub_for_rescheduling();
        request
    }

    /// Drop accounting for a finished chain
    pub fn forget(&self, lineage: RequestId) {
        utils::lock(&self.attempts).remove(&lineage);
    }

    /// Number of chains with recorded attempts
    pub fn tracked(&self) -> usize {
        utils::lock(&self.attempts).len()
    }
}

fn is_rejected_resume(failure: &StratusError) -> bool {
    matches!(failure, StratusError::Network(NetworkError::ResumeRejected(_)))
}
