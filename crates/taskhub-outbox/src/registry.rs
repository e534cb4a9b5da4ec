//! Dispatch registry: event type tag to ordered handler list.
//!
//! The registry is assembled once at startup with [`DispatchRegistryBuilder`]
//! and handed to the worker behind an `Arc`. It is immutable afterwards.
//!
//! ```ignore
//! let mut builder = DispatchRegistry::builder();
//! builder.register(event_types::TASK_ASSIGNED, NotifyAssignee::new(mailer))?;
//! builder.register_typed(SearchIndexer::new(index))?;
//! builder.expect_event_types(event_types::ALL.iter().copied());
//! let registry = Arc::new(builder.build()?);
//! ```

use crate::events::DomainEvent;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use taskhub_database::OutboxRecord;
use thiserror::Error;

/// What a handler sees of an outbox record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub record_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    /// 1 on the first delivery, 2 on the first retry, and so on.
    pub attempt: u32,
}

impl From<&OutboxRecord> for EventEnvelope {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            idempotency_key: record.idempotency_key.clone(),
            attempt: record.retry_count.saturating_add(1),
        }
    }
}

/// Reacts to one event type. Handlers must be idempotent: delivery is
/// at-least-once and a failed chain is retried from the first handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and `last_error`.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Handler over a decoded [`DomainEvent`]. Register it with
/// [`DispatchRegistryBuilder::register_typed`].
#[async_trait]
pub trait TypedEventHandler<E: DomainEvent>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: E, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Adapts a [`TypedEventHandler`] to the byte-level [`EventHandler`].
pub struct TypedHandler<E, H> {
    inner: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> TypedHandler<E, H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> EventHandler for TypedHandler<E, H>
where
    E: DomainEvent,
    H: TypedEventHandler<E>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let event = E::decode(&envelope.payload)
            .map_err(|e| anyhow::anyhow!("malformed payload for {}: {}", E::EVENT_TYPE, e))?;
        self.inner.handle(event, envelope).await
    }
}

/// Why a dispatch failed. The `Display` form is what lands in `last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown_event_type: no handler registered for '{0}'")]
    UnknownEventType(String),

    #[error("handler_failed: {handler}: {message}")]
    HandlerFailed { handler: String, message: String },

    #[error("handler_timeout: {handler} did not finish within {timeout_ms}ms")]
    HandlerTimeout { handler: String, timeout_ms: u64 },
}

impl DispatchError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownEventType(_) => "unknown_event_type",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::HandlerTimeout { .. } => "handler_timeout",
        }
    }
}

/// Registration errors, raised before the worker starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Event type must not be empty")]
    EmptyEventType,

    #[error("Handler '{handler}' is already registered for '{event_type}'")]
    AlreadyRegistered { event_type: String, handler: String },

    #[error("No handler registered for: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),
}

/// Collects handlers before the registry is frozen.
#[derive(Default)]
pub struct DispatchRegistryBuilder {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    expected: BTreeSet<String>,
}

impl DispatchRegistryBuilder {
    /// Append `handler` to the chain for `event_type`.
    pub fn register<H>(&mut self, event_type: &str, handler: H) -> Result<&mut Self, RegistryError>
    where
        H: EventHandler + 'static,
    {
        self.register_shared(event_type, Arc::new(handler))
    }

    /// Like [`register`](Self::register) for a handler shared across tags.
    pub fn register_shared(
        &mut self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<&mut Self, RegistryError> {
        if event_type.trim().is_empty() {
            return Err(RegistryError::EmptyEventType);
        }

        let chain = self.handlers.entry(event_type.to_string()).or_default();
        if chain.iter().any(|h| h.name() == handler.name()) {
            return Err(RegistryError::AlreadyRegistered {
                event_type: event_type.to_string(),
                handler: handler.name().to_string(),
            });
        }
        chain.push(handler);
        Ok(self)
    }

    /// Register a typed handler under `E::EVENT_TYPE`.
    pub fn register_typed<E, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        E: DomainEvent,
        H: TypedEventHandler<E> + 'static,
    {
        self.register(E::EVENT_TYPE, TypedHandler::<E, H>::new(handler))
    }

    /// Make [`build`](Self::build) fail unless every tag in `event_types`
    /// has at least one handler.
    pub fn expect_event_types<I, S>(&mut self, event_types: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected.extend(event_types.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<DispatchRegistry, RegistryError> {
        let missing: Vec<String> = self
            .expected
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingHandlers(missing));
        }

        Ok(DispatchRegistry {
            handlers: self.handlers,
        })
    }
}

/// Immutable event type to handler-chain map.
pub struct DispatchRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl DispatchRegistry {
    pub fn builder() -> DispatchRegistryBuilder {
        DispatchRegistryBuilder::default()
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Handler names for `event_type`, in invocation order.
    pub fn handler_names(&self, event_type: &str) -> Vec<String> {
        self.handlers
            .get(event_type)
            .map(|chain| chain.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Number of handlers chained for `event_type`; zero when unknown.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Registered tags, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run the chain for `envelope.event_type` in registration order.
    ///
    /// Each handler gets its own `timeout`. The first failure, timeout or
    /// panic stops the chain.
    pub async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let chain = self
            .handlers
            .get(&envelope.event_type)
            .ok_or_else(|| DispatchError::UnknownEventType(envelope.event_type.clone()))?;

        for handler in chain {
            let call = AssertUnwindSafe(handler.handle(envelope)).catch_unwind();
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    return Err(DispatchError::HandlerFailed {
                        handler: handler.name().to_string(),
                        message: format!("{e:#}"),
                    });
                }
                Ok(Err(_panic)) => {
                    return Err(DispatchError::HandlerFailed {
                        handler: handler.name().to_string(),
                        message: "handler panicked".to_string(),
                    });
                }
                Err(_elapsed) => {
                    return Err(DispatchError::HandlerTimeout {
                        handler: handler.name().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
        Ok(())
    }
}
