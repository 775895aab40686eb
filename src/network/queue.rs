//! Request queue
//!
//! Admits requests, dispatches them to the transport when their gates allow,
//! and routes every completion through redirect and resume handling before
//! reporting a single terminal outcome.
//!
//! All scheduling state lives in one [`AdmissionState`] behind one mutex.
//! Network I/O runs in spawned Tokio tasks, so submitting and the control
//! calls must happen inside a Tokio runtime.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use futures::future::{AbortHandle, AbortRegistration, Abortable};
use tokio::sync::{Notify, oneshot};

use super::admission::{AdmissionState, Phase};
use super::connection::Connection;
use super::redirect::{RedirectEngine, RedirectOutcome};
use super::request::{Request, RequestId};
use super::response::Response;
use super::resume::{ResumeController, ResumePlan};
use super::transport::{
    CertificateCheck, Transport, TransportContext, TransportFailure, TransportResult,
};
use super::validation::{ConnectionValidator, StatusValidator};
use crate::auth::AuthenticationMethod;
use crate::config::QueueConfig;
use crate::events::{Event, EventDispatcher, EventSender};
use crate::security::TrustGate;
use crate::utils::{self, Result, StratusError};

/// Terminal outcome of a request
#[derive(Debug, Clone)]
pub struct Completion {
    /// The request as last dispatched (effective URL, redirect history)
    pub request: Request,
    pub response: Response,
}

impl Completion {
    pub fn error(&self) -> Option<&StratusError> {
        self.response.error()
    }

    pub fn is_success(&self) -> bool {
        self.response.is_success()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error().is_some_and(StratusError::is_cancellation)
    }
}

/// Handle returned on admission
#[derive(Debug)]
pub struct Ticket {
    id: RequestId,
    receiver: oneshot::Receiver<Completion>,
}

impl Ticket {
    /// Identifier the request was admitted with
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> Result<Completion> {
        self.receiver.await.map_err(|_| StratusError::ShutDown)
    }
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: u64,
}

/// Configures and builds a [`RequestQueue`]
pub struct RequestQueueBuilder {
    transport: Arc<dyn Transport>,
    config: QueueConfig,
    trust: Option<Arc<TrustGate>>,
    authentication: Option<(Arc<dyn AuthenticationMethod>, Connection)>,
    validator: Option<Arc<dyn ConnectionValidator>>,
    events: Option<Arc<EventDispatcher>>,
}

impl RequestQueueBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn trust_gate(mut self, gate: Arc<TrustGate>) -> Self {
        self.trust = Some(gate);
        self
    }

    /// Authorize outgoing requests with `method` for `connection`
    pub fn authentication(mut self, method: Arc<dyn AuthenticationMethod>, connection: Connection) -> Self {
        self.authentication = Some((method, connection));
        self
    }

    /// Replace the default `status.php` validator
    pub fn connection_validator(mut self, validator: Arc<dyn ConnectionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Deliver outcomes of requests with an event target through `dispatcher`
    pub fn event_dispatcher(mut self, dispatcher: Arc<EventDispatcher>) -> Self {
        self.events = Some(dispatcher);
        self
    }

    pub fn build(self) -> Result<RequestQueue> {
        if self.config.max_concurrent_requests == 0 {
            return Err(StratusError::Config(
                "max-concurrent-requests must be at least 1".into(),
            ));
        }
        let trust = self.trust.unwrap_or_default();
        let validator = match self.validator {
            Some(validator) => validator,
            None => {
                let mut validator = StatusValidator::new(Arc::clone(&self.transport), Arc::clone(&trust));
                if let Some((method, connection)) = &self.authentication {
                    validator = validator.with_authentication(Arc::clone(method), connection.clone());
                }
                Arc::new(validator)
            }
        };
        let events = match self.events {
            Some(dispatcher) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(StratusError::Config(
                        "event delivery needs a running Tokio runtime".into(),
                    ));
                }
                Some(dispatcher.spawn_delivery())
            }
            None => None,
        };

        Ok(RequestQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(AdmissionState::new(self.config.cellular_switch_default)),
                redirects: RedirectEngine::new(
                    self.config.default_redirect_policy,
                    self.config.max_redirect_depth,
                ),
                resume: ResumeController::new(),
                config: self.config,
                transport: self.transport,
                trust,
                authentication: self.authentication.map(|(method, connection)| Authorization {
                    method,
                    connection: RwLock::new(connection),
                }),
                validator,
                events,
                idle: Notify::new(),
            }),
        })
    }
}

/// Priority request queue with gating, redirect and resume handling
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<AdmissionState>,
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    trust: Arc<TrustGate>,
    authentication: Option<Authorization>,
    redirects: RedirectEngine,
    resume: ResumeController,
    validator: Arc<dyn ConnectionValidator>,
    events: Option<EventSender>,
    idle: Notify,
}

/// Authentication method bound to the connection it signs requests for
struct Authorization {
    method: Arc<dyn AuthenticationMethod>,
    connection: RwLock<Connection>,
}

impl Authorization {
    /// Authorize `request` if it targets the connection's origin
    fn apply(&self, request: Request) -> Result<Request> {
        let connection = utils::read(&self.connection).clone();
        if !connection.serves(request.effective_url()) {
            log::debug!(
                "[queue] not authorizing {}: outside {}",
                request.effective_url(),
                connection.base_url()
            );
            return Ok(request);
        }
        self.method.authorize(request, &connection)
    }

    /// Follow a validated move of the server to `target`
    fn relocate(&self, target: &url::Url) -> Result<()> {
        let mut connection = utils::write(&self.connection);
        if !connection.serves(target) {
            *connection = connection.moved_to(target)?;
            log::info!("[queue] connection moved to {}", connection.base_url());
        }
        Ok(())
    }
}

impl RequestQueue {
    pub fn builder(transport: Arc<dyn Transport>) -> RequestQueueBuilder {
        RequestQueueBuilder {
            transport,
            config: QueueConfig::default(),
            trust: None,
            authentication: None,
            validator: None,
            events: None,
        }
    }

    /// Queue with default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).build()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn trust_gate(&self) -> &Arc<TrustGate> {
        &self.inner.trust
    }

    /// Admit a request
    pub fn submit(&self, mut request: Request) -> Result<Ticket> {
        if request.is_cancelled() {
            return Err(StratusError::Cancelled);
        }
        if !request.has_priority() {
            request.set_priority(self.inner.config.default_priority);
        }
        request.validate()?;
        request.prepare_for_scheduling(Some(&self.inner.config.user_agent));

        let id = request.id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = utils::lock(&self.inner.state);
            if state.shut_down {
                return Err(StratusError::ShutDown);
            }
            let sequence = state.insert(request, tx);
            log::debug!("[queue] admitted {} as #{}", id, sequence);
        }
        self.inner.schedule();
        Ok(Ticket { id, receiver: rx })
    }

    /// Cancel by current identifier or chain lineage.
    ///
    /// Returns false when nothing was cancelled (unknown, finished or
    /// already cancelled).
    pub fn cancel(&self, id: RequestId) -> bool {
        self.inner.cancel(id)
    }

    /// Update a signal and re-evaluate admission
    pub fn signal_state_changed(&self, signal: &str, satisfied: bool) {
        let changed = utils::lock(&self.inner.state).set_signal(signal, satisfied);
        log::debug!("[queue] signal {} -> {}", signal, satisfied);
        if changed {
            self.inner.schedule();
        }
    }

    /// Allow or forbid cellular use for a switch
    pub fn set_cellular_switch(&self, switch: &str, allowed: bool) {
        let changed = utils::lock(&self.inner.state).set_cellular_switch(switch, allowed);
        if changed {
            self.inner.schedule();
        }
    }

    /// Report whether the device is currently on a cellular network
    pub fn set_on_cellular(&self, on_cellular: bool) {
        let changed = utils::lock(&self.inner.state).set_on_cellular(on_cellular);
        if changed {
            self.inner.schedule();
        }
    }

    /// Stop accepting requests; optionally cancel the non-critical ones
    pub fn shutdown(&self, allow_non_critical_cancel: bool) {
        let doomed = {
            let mut state = utils::lock(&self.inner.state);
            state.shut_down = true;
            if allow_non_critical_cancel {
                state.non_critical()
            } else {
                Vec::new()
            }
        };
        log::info!("[queue] shutting down, cancelling {} non-critical requests", doomed.len());
        for id in doomed {
            self.inner.cancel(id);
        }
    }

    /// Wait until every admitted request has finished
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_idle(&self) -> bool {
        utils::lock(&self.inner.state).is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = utils::lock(&self.inner.state);
        QueueStats {
            pending: state.pending(),
            in_flight: state.in_flight(),
            completed: state.completed,
        }
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("stats", &self.stats())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl QueueInner {
    /// Dispatch whatever is runnable and arm the earliest-begin timer
    fn schedule(self: &Arc<Self>) {
        let now = SystemTime::now();
        let (dispatch, wake) = {
            let mut state = utils::lock(&self.state);
            let (batch, wake) = state.select(now, self.config.max_concurrent_requests);
            let mut dispatch = Vec::with_capacity(batch.len());
            for sequence in batch {
                let (handle, registration) = AbortHandle::new_pair();
                if let Some(request) = state.start(sequence, handle) {
                    dispatch.push((sequence, request, registration));
                }
            }
            let wake = wake.filter(|at| state.arm_timer(*at));
            (dispatch, wake)
        };

        for (sequence, request, registration) in dispatch {
            log::debug!(
                "[queue] dispatching #{} {} {} (priority {})",
                sequence,
                request.method(),
                request.effective_url(),
                request.priority()
            );
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run(sequence, request, registration).await });
        }

        if let Some(at) = wake {
            let delay = at.duration_since(now).unwrap_or_default();
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                utils::lock(&inner.state).timer_fired(at);
                inner.schedule();
            });
        }
    }

    async fn run(self: Arc<Self>, sequence: u64, request: Request, registration: AbortRegistration) {
        let outcome = Abortable::new(self.execute(request.clone()), registration)
            .await
            .unwrap_or_else(|_| Err(TransportFailure::new(StratusError::Cancelled)));
        self.conclude(sequence, request, outcome).await;
    }

    /// One transport attempt: authorize, send, check the certificate
    async fn execute(&self, mut request: Request) -> TransportResult {
        if !request.skips_authorization()
            && let Some(authorization) = &self.authentication
        {
            request = authorization.apply(request)?;
        }
        let host = request.effective_url().host_str().unwrap_or_default().to_string();
        let check = CertificateCheck::new(Arc::clone(&self.trust), request.forces_certificate_decision())
            .with_handler(request.certificate_decision_handler().cloned());
        log::trace!("[queue] sending {}", request.description());

        let response = self
            .transport
            .send(request, TransportContext::new(check.clone()))
            .await?;
        if !check.was_evaluated()
            && let Some(certificate) = response.certificate()
        {
            check.check(certificate, &host)?;
        }
        Ok(response)
    }

    async fn conclude(self: &Arc<Self>, sequence: u64, request: Request, outcome: TransportResult) {
        if utils::lock(&self.state).is_cancelled(sequence) {
            self.finish(sequence, request, Response::failed(StratusError::Cancelled));
            return;
        }

        let response = match outcome {
            Ok(response) => response,
            Err(TransportFailure {
                error,
                resume_info,
                response,
            }) => {
                match self.resume.plan(request.clone(), &error, resume_info) {
                    ResumePlan::Resume(next) | ResumePlan::Restart(next) => self.requeue(sequence, next),
                    ResumePlan::GiveUp => {
                        let response = response.unwrap_or_default().with_error(error);
                        self.finish(sequence, request, response);
                    }
                }
                return;
            }
        };
        if !response.is_redirect() {
            self.finish(sequence, request, response);
            return;
        }

        match self.redirects.decide(&request, response) {
            RedirectOutcome::Surfaced(response) => self.finish(sequence, request, response),
            RedirectOutcome::Followed(next) => self.requeue(sequence, next),
            RedirectOutcome::Validate {
                request: next,
                response,
            } => {
                let target = next.effective_url().clone();
                let validated = match self.validator.validate(target.clone()).await {
                    Ok(()) => match &self.authentication {
                        Some(authorization) => authorization.relocate(&target),
                        None => Ok(()),
                    },
                    Err(err) => Err(err),
                };
                match validated {
                    Ok(()) => self.requeue(sequence, next),
                    Err(err) => {
                        log::warn!(
                            "[redirect] validation of {} failed: {}",
                            next.effective_url(),
                            err
                        );
                        self.finish(sequence, request, response);
                    }
                }
            }
            RedirectOutcome::LoopDetected { response, max_depth } => {
                self.finish(
                    sequence,
                    request,
                    response.with_error(StratusError::RedirectLoop { max_depth }),
                );
            }
        }
    }

    /// Put a re-issued request back in its original slot
    fn requeue(self: &Arc<Self>, sequence: u64, request: Request) {
        let refused = utils::lock(&self.state).requeue(sequence, request);
        match refused {
            Some(request) => {
                self.finish(sequence, request, Response::failed(StratusError::Cancelled));
            }
            None => {
                log::debug!("[queue] re-queued #{}", sequence);
                self.schedule();
            }
        }
    }

    /// Produce the single terminal outcome for the entry at `sequence`
    fn finish(self: &Arc<Self>, sequence: u64, mut request: Request, response: Response) {
        let (entry, idle) = {
            let mut state = utils::lock(&self.state);
            let entry = state.remove(sequence);
            if entry.is_some() {
                state.completed += 1;
            }
            (entry, state.is_empty())
        };
        let Some(entry) = entry else {
            return;
        };
        self.resume.forget(request.lineage());

        match response.error() {
            Some(StratusError::Cancelled) => {
                request.mark_cancelled();
                log::debug!("[queue] #{} {} cancelled", sequence, request.url());
            }
            Some(err) => log::info!("[queue] #{} {} failed: {}", sequence, request.url(), err),
            None => log::debug!(
                "[queue] #{} {} finished with {:?}",
                sequence,
                request.effective_url(),
                response.status()
            ),
        }

        self.schedule();

        if let (Some(target), Some(events)) = (request.event_target(), &self.events) {
            events.send(Event::for_completion(target, &request, response.clone()));
        }
        if let Some(tx) = entry.completion {
            let _ = tx.send(Completion { request, response });
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn cancel(self: &Arc<Self>, id: RequestId) -> bool {
        let pending = {
            let mut state = utils::lock(&self.state);
            let Some(sequence) = state.find(id) else {
                return false;
            };
            let Some(entry) = state.get_mut(sequence) else {
                return false;
            };
            if entry.request.is_cancelled() {
                return false;
            }
            entry.request.mark_cancelled();
            match &entry.phase {
                Phase::Pending => Some((sequence, entry.request.clone())),
                Phase::InFlight(handle) => {
                    handle.abort();
                    None
                }
            }
        };

        match pending {
            Some((sequence, request)) => {
                log::debug!("[queue] cancelled #{} before dispatch", sequence);
                self.finish(sequence, request, Response::failed(StratusError::Cancelled));
            }
            None => log::debug!("[queue] asked transport to abort {}", id),
        }
        true
    }
}
