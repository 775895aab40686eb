//! Event delivery
//!
//! Terminal request outcomes are wrapped in an [`Event`] and handed to the
//! handler registered under the request's target identifier. Handlers are
//! looked up at delivery time, so a handler registered after submission
//! still receives the outcome.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::network::{Request, RequestId, Response};
use crate::utils::{self, StratusError};

/// Event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    CreateFolder,
    CreateFile,
    Move,
    Copy,
    Delete,
    Upload,
    Download,
    RetrieveThumbnail,
    CreateShare,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateFolder => "create-folder",
            Self::CreateFile => "create-file",
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Delete => "delete",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::RetrieveThumbnail => "retrieve-thumbnail",
            Self::CreateShare => "create-share",
        }
    }
}

/// Where a request's outcome should be delivered
#[derive(Debug, Clone, PartialEq)]
pub struct EventTarget {
    pub handler_id: String,
    pub event_type: EventType,
    pub user_info: Map<String, Value>,
}

impl EventTarget {
    pub fn new(handler_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            handler_id: handler_id.into(),
            event_type,
            user_info: Map::new(),
        }
    }

    /// Attach a value that is copied into every event for this target
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }
}

/// A delivered outcome.
///
/// Events are not `Clone`: each instance is delivered at most once.
#[derive(Debug)]
pub struct Event {
    /// Originating request, `None` when unknown
    pub event_id: Option<RequestId>,
    pub event_type: EventType,
    pub handler_id: String,
    pub attributes: Map<String, Value>,
    pub response: Option<Response>,
    pub error: Option<StratusError>,
}

impl Event {
    /// Create a new event with no originating request
    pub fn new(handler_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            event_id: None,
            event_type,
            handler_id: handler_id.into(),
            attributes: Map::new(),
            response: None,
            error: None,
        }
    }

    /// Event describing the terminal outcome of `request`
    pub fn for_completion(target: &EventTarget, request: &Request, response: Response) -> Self {
        let mut attributes = target.user_info.clone();
        attributes.insert("url".into(), Value::from(request.effective_url().as_str()));
        attributes.insert("method".into(), Value::from(request.method().as_str()));
        if let Some(status) = response.status() {
            attributes.insert("status".into(), Value::from(status));
        }
        if request.redirect_count() > 0 {
            let history = request
                .redirect_history()
                .iter()
                .map(|url| Value::from(url.as_str()))
                .collect();
            attributes.insert("redirect-history".into(), Value::Array(history));
        }
        if let Some(path) = response.body_file() {
            attributes.insert("file".into(), Value::from(path.display().to_string()));
        }
        for (key, value) in request.user_info() {
            attributes.insert(key.clone(), Value::from(value.as_str()));
        }

        Self {
            event_id: Some(request.lineage()),
            event_type: target.event_type,
            handler_id: target.handler_id.clone(),
            attributes,
            error: response.error().cloned(),
            response: Some(response),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(StratusError::is_cancellation)
    }
}

/// Event handler callback type
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Registry of event handlers keyed by handler identifier
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, EventHandler>>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same identifier
    pub fn register(&self, handler_id: impl Into<String>, handler: EventHandler) {
        let handler_id = handler_id.into();
        log::debug!("[events] registered handler {}", handler_id);
        utils::write(&self.handlers).insert(handler_id, handler);
    }

    /// Remove a handler
    pub fn unregister(&self, handler_id: &str) -> bool {
        utils::write(&self.handlers).remove(handler_id).is_some()
    }

    pub fn is_registered(&self, handler_id: &str) -> bool {
        utils::read(&self.handlers).contains_key(handler_id)
    }

    /// Get handler count
    pub fn handler_count(&self) -> usize {
        utils::read(&self.handlers).len()
    }

    /// Deliver an event to its handler. Returns false when nobody is listening.
    pub fn deliver(&self, event: Event) -> bool {
        let handler = utils::read(&self.handlers).get(&event.handler_id).cloned();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                log::warn!(
                    "[events] no handler registered for {}, dropping {} event",
                    event.handler_id,
                    event.event_type.as_str()
                );
                false
            }
        }
    }

    /// Start a task that delivers events sent through the returned sender.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_delivery(self: &Arc<Self>) -> EventSender {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.deliver(event);
            }
            log::trace!("[events] delivery task finished");
        });
        EventSender { tx }
    }
}

/// Sending half of a delivery task
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Queue an event for delivery without waiting for the handler
    pub fn send(&self, event: Event) {
        if let Err(err) = self.tx.send(event) {
            log::warn!("[events] delivery task gone, dropping event for {}", err.0.handler_id);
        }
    }
}
