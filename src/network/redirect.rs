//! Redirect handling
//!
//! Decides what happens to a completed request whose response is a
//! redirect. The engine never mutates the request in place: it hands back
//! either a new request to schedule or the response to surface.

use serde::{Deserialize, Serialize};
use url::Url;

use super::headers::names;
use super::request::{Method, Request};
use super::response::Response;

/// Redirect depth used when neither the request nor the queue sets one
pub const DEFAULT_MAX_REDIRECT_DEPTH: u8 = 5;

/// How redirects are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectPolicy {
    /// Use the queue's configured policy
    #[default]
    Default,
    /// Never follow, surface the response as-is
    HandleLocally,
    /// Follow only when scheme, host and port stay the same
    AllowSameHost,
    /// Always follow
    AllowAnyHost,
    /// Re-validate the connection against the new host, then retry there
    ValidateConnection,
}

/// Result of inspecting a redirect response
#[derive(Debug)]
pub enum RedirectOutcome {
    /// Follow transparently with this request
    Followed(Request),
    /// Deliver the redirect response to the caller unchanged
    Surfaced(Response),
    /// Re-validate the connection; on success schedule `request`,
    /// otherwise surface `response`
    Validate { request: Request, response: Response },
    /// Too many hops
    LoopDetected { response: Response, max_depth: u8 },
}

/// Redirect state machine
#[derive(Debug, Clone)]
pub struct RedirectEngine {
    default_policy: RedirectPolicy,
    default_max_depth: u8,
}

impl RedirectEngine {
    /// Create an engine with the queue-wide defaults
    pub fn new(default_policy: RedirectPolicy, default_max_depth: u8) -> Self {
        Self {
            default_policy,
            default_max_depth,
        }
    }

    /// Policy actually applied to `request`
    pub fn effective_policy(&self, request: &Request) -> RedirectPolicy {
        match (request.redirect_policy(), self.default_policy) {
            (RedirectPolicy::Default, RedirectPolicy::Default) => RedirectPolicy::ValidateConnection,
            (RedirectPolicy::Default, policy) => policy,
            (policy, _) => policy,
        }
    }

    /// Depth limit applied to `request`
    pub fn max_depth(&self, request: &Request) -> u8 {
        request.max_redirect_depth().unwrap_or(self.default_max_depth)
    }

    /// Inspect a completed response
    pub fn decide(&self, request: &Request, response: Response) -> RedirectOutcome {
        if !response.is_redirect() {
            return RedirectOutcome::Surfaced(response);
        }
        let Some(target) = response.redirect_location(request.effective_url()) else {
            log::warn!(
                "[redirect] status {:?} for {} without usable Location header",
                response.status(),
                request.effective_url()
            );
            return RedirectOutcome::Surfaced(response);
        };
        if !matches!(target.scheme(), "http" | "https") {
            log::warn!("[redirect] refusing redirect to {}", target);
            return RedirectOutcome::Surfaced(response);
        }

        let policy = self.effective_policy(request);
        match policy {
            RedirectPolicy::HandleLocally => return RedirectOutcome::Surfaced(response),
            RedirectPolicy::AllowSameHost if !same_origin(request.url(), &target) => {
                log::debug!(
                    "[redirect] {} -> {} crosses hosts, surfacing",
                    request.effective_url(),
                    target
                );
                return RedirectOutcome::Surfaced(response);
            }
            _ => {}
        }

        let max_depth = self.max_depth(request);
        if request.redirect_count() >= usize::from(max_depth) {
            log::warn!(
                "[redirect] {} exceeded {} redirects",
                request.url(),
                max_depth
            );
            return RedirectOutcome::LoopDetected { response, max_depth };
        }

        let next = follow(request, target, response.status().unwrap_or(302));
        if policy == RedirectPolicy::ValidateConnection {
            RedirectOutcome::Validate {
                request: next,
                response,
            }
        } else {
            log::debug!(
                "[redirect] following {} -> {}",
                request.effective_url(),
                next.effective_url()
            );
            RedirectOutcome::Followed(next)
        }
    }
}

impl Default for RedirectEngine {
    fn default() -> Self {
        Self::new(RedirectPolicy::ValidateConnection, DEFAULT_MAX_REDIRECT_DEPTH)
    }
}

/// Scheme, host and port match
fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Copy of `request` re-targeted at `target`
fn follow(request: &Request, target: Url, status: u16) -> Request {
    let mut next = request.clone();
    if !same_origin(request.effective_url(), &target) {
        next.remove_header(names::AUTHORIZATION);
    }
    if status == 303 && next.method() != Method::Head {
        next.set_method(Method::Get);
        next.clear_body();
    }
    next.record_redirect(target);
    next.scrub_for_rescheduling();
    next
}
