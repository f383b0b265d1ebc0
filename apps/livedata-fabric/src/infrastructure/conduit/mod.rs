//! Request/Response Conduit
//!
//! Transport-agnostic request/response exchange used by the satellite
//! protocols (entitlement checks and specification resolution). Payloads
//! are JSON values inside an [`Envelope`] carrying a correlation id; a
//! reply must echo the id of the request it answers.
//!
//! [`InMemoryConduit`] serves a [`RequestHandler`] on a background task
//! that owns the handler and answers requests one at a time over an
//! `mpsc` queue with a `oneshot` reply per request.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::CollaboratorError;

// =============================================================================
// Errors
// =============================================================================

/// Conduit error.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    /// The serving side is gone.
    #[error("conduit closed")]
    Closed,

    /// The remote handler failed.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// A payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The reply answers a different request.
    #[error("reply correlation id {actual} does not match request {expected}")]
    CorrelationMismatch {
        /// Id of the request sent.
        expected: Uuid,
        /// Id carried by the reply.
        actual: Uuid,
    },
}

impl From<ConduitError> for CollaboratorError {
    fn from(err: ConduitError) -> Self {
        match err {
            ConduitError::Closed | ConduitError::Remote(_) => Self::Unavailable(err.to_string()),
            ConduitError::Codec(_) | ConduitError::CorrelationMismatch { .. } => {
                Self::Protocol(err.to_string())
            }
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// One message on the conduit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Id shared by a request and its reply.
    pub correlation_id: Uuid,
    /// JSON body.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a request body under a fresh correlation id.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the body cannot be serialized.
    pub fn request<T: Serialize>(body: &T) -> Result<Self, ConduitError> {
        Ok(Self {
            correlation_id: Uuid::new_v4(),
            payload: serde_json::to_value(body)?,
        })
    }

    /// Build the reply to this envelope.
    #[must_use]
    pub const fn reply(&self, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: self.correlation_id,
            payload,
        }
    }

    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the payload is not a `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConduitError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Client side of a conduit.
#[async_trait]
pub trait RequestConduit: Send + Sync {
    /// Send a request and wait for its reply.
    async fn request(&self, envelope: Envelope) -> Result<Envelope, ConduitError>;
}

/// Serving side of a conduit.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Answer one request payload.
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, ConduitError>;
}

/// Typed request/response exchange.
///
/// # Errors
///
/// Returns the conduit error, a codec error, or `CorrelationMismatch` when
/// the reply does not answer this request.
pub async fn call<Req, Resp>(conduit: &dyn RequestConduit, request: &Req) -> Result<Resp, ConduitError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let envelope = Envelope::request(request)?;
    let expected = envelope.correlation_id;

    let reply = conduit.request(envelope).await?;
    if reply.correlation_id != expected {
        return Err(ConduitError::CorrelationMismatch {
            expected,
            actual: reply.correlation_id,
        });
    }
    reply.decode()
}

// =============================================================================
// In-Memory Conduit
// =============================================================================

type Job = (Envelope, oneshot::Sender<Result<Envelope, ConduitError>>);

/// Conduit served by a handler task in the same process.
#[derive(Debug, Clone)]
pub struct InMemoryConduit {
    tx: mpsc::Sender<Job>,
}

impl InMemoryConduit {
    /// Spawn a task serving `handler` and return the client handle.
    ///
    /// The task stops when `cancel` fires or every client handle is dropped.
    #[must_use]
    pub fn serve<H: RequestHandler>(
        handler: H,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Conduit server shutting down");
                        break;
                    }
                    job = rx.recv() => {
                        let Some((envelope, reply_tx)) = job else {
                            break;
                        };
                        let result = handler
                            .handle(envelope.payload.clone())
                            .await
                            .map(|payload| envelope.reply(payload));
                        if let Err(e) = &result {
                            tracing::warn!(
                                correlation_id = %envelope.correlation_id,
                                error = %e,
                                "Conduit request failed"
                            );
                        }
                        let _ = reply_tx.send(result);
                    }
                }
            }
        });

        (Self { tx }, task)
    }
}

#[async_trait]
impl RequestConduit for InMemoryConduit {
    async fn request(&self, envelope: Envelope) -> Result<Envelope, ConduitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((envelope, reply_tx))
            .await
            .map_err(|_| ConduitError::Closed)?;
        reply_rx.await.map_err(|_| ConduitError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value, ConduitError> {
            if payload.get("fail").is_some() {
                return Err(ConduitError::Remote("asked to fail".to_string()));
            }
            Ok(payload)
        }
    }

    /// Replies under a fresh correlation id.
    struct Misrouted;

    #[async_trait]
    impl RequestConduit for Misrouted {
        async fn request(&self, envelope: Envelope) -> Result<Envelope, ConduitError> {
            Ok(Envelope {
                correlation_id: Uuid::new_v4(),
                payload: envelope.payload,
            })
        }
    }

    #[tokio::test]
    async fn call_round_trips_through_handler() {
        let (conduit, _task) = InMemoryConduit::serve(Echo, 8, CancellationToken::new());
        let reply: serde_json::Value = call(&conduit, &json!({"value": 7})).await.unwrap();
        assert_eq!(reply, json!({"value": 7}));
    }

    #[tokio::test]
    async fn remote_failure_is_returned() {
        let (conduit, _task) = InMemoryConduit::serve(Echo, 8, CancellationToken::new());
        let result: Result<serde_json::Value, _> = call(&conduit, &json!({"fail": true})).await;
        assert!(matches!(result, Err(ConduitError::Remote(_))));
    }

    #[tokio::test]
    async fn mismatched_reply_is_rejected() {
        let result: Result<serde_json::Value, _> = call(&Misrouted, &json!({})).await;
        assert!(matches!(result, Err(ConduitError::CorrelationMismatch { .. })));
    }

    #[tokio::test]
    async fn cancelled_server_closes_conduit() {
        let cancel = CancellationToken::new();
        let (conduit, task) = InMemoryConduit::serve(Echo, 8, cancel.clone());
        cancel.cancel();
        task.await.unwrap();

        let result: Result<serde_json::Value, _> = call(&conduit, &json!({})).await;
        assert!(matches!(result, Err(ConduitError::Closed)));
    }

    #[test]
    fn decode_reports_codec_errors() {
        let envelope = Envelope::request(&json!({"allowed": "yes"})).unwrap();
        let result: Result<u32, _> = envelope.decode();
        assert!(matches!(result, Err(ConduitError::Codec(_))));
    }

    #[test]
    fn collaborator_error_mapping() {
        assert!(matches!(
            CollaboratorError::from(ConduitError::Closed),
            CollaboratorError::Unavailable(_)
        ));
        assert!(matches!(
            CollaboratorError::from(ConduitError::CorrelationMismatch {
                expected: Uuid::nil(),
                actual: Uuid::new_v4(),
            }),
            CollaboratorError::Protocol(_)
        ));
    }
}
