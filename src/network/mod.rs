//! Request scheduling and transport control
//!
//! Requests are admitted into a [`RequestQueue`], held back until their
//! group, signal, cellular and time constraints allow, dispatched in
//! priority order onto a [`Transport`], and concluded once redirects,
//! resumes and certificate decisions have been settled.

mod admission;
mod client;
mod connection;
pub mod headers;
pub mod priority;
pub mod progress;
mod queue;
pub mod redirect;
pub mod request;
mod response;
pub mod resume;
mod transport;
mod validation;

pub use client::ReqwestTransport;
pub use connection::Connection;
pub use headers::HeaderFields;
pub use progress::{ProgressReporter, TransferProgress};
pub use queue::{Completion, QueueStats, RequestQueue, RequestQueueBuilder, Ticket};
pub use redirect::{RedirectEngine, RedirectOutcome, RedirectPolicy};
pub use request::{Body, Method, Request, RequestId};
pub use response::{Response, ResponseBody};
pub use resume::{ResumeController, ResumeInfo, ResumePlan};
pub use transport::{CertificateCheck, Transport, TransportContext, TransportFailure, TransportResult};
pub use validation::{ConnectionValidator, StatusValidator};

use std::sync::Arc;

use crate::auth::AuthenticationMethod;
use crate::config::StratusConfig;
use crate::events::EventDispatcher;
use crate::security::TrustGate;
use crate::utils::Result;

/// A queue wired to the production transport
pub struct NetworkStack {
    queue: RequestQueue,
    events: Arc<EventDispatcher>,
}

impl NetworkStack {
    /// Create a network stack; must be called inside a Tokio runtime
    pub fn new(
        config: &StratusConfig,
        trust: Arc<TrustGate>,
        authentication: Option<(Arc<dyn AuthenticationMethod>, Connection)>,
    ) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.transport, Arc::clone(&trust))?);
        let events = Arc::new(EventDispatcher::new());
        let mut builder = RequestQueue::builder(transport)
            .config(config.queue.clone())
            .trust_gate(trust)
            .event_dispatcher(Arc::clone(&events));
        if let Some((method, connection)) = authentication {
            builder = builder.authentication(method, connection);
        }
        Ok(Self {
            queue: builder.build()?,
            events,
        })
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Submit a request and wait for its terminal outcome
    pub async fn send(&self, request: Request) -> Result<Completion> {
        self.queue.submit(request)?.wait().await
    }

    /// Fetch a resource from the given URL
    pub async fn fetch(&self, url: &str) -> Result<Completion> {
        self.send(Request::get(url)?).await
    }
}
