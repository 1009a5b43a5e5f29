//! Backend capability interface.
//!
//! A backend turns a normalized request into a reply from one model
//! provider. Implementations are registered by name in a
//! [`BackendRegistry`] when the engine is built.

mod echo;
mod registry;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use echo::EchoBackend;
pub use registry::BackendRegistry;

/// Incremental reply chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Normalized request for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub request_id: String,
    pub model_id: String,
    /// Device the model is resident on.
    pub device_id: String,
    pub input: String,
}

/// Per-call limits handed to the backend.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

pub enum BackendReply {
    Complete(String),
    Stream(ChunkStream),
}

impl BackendReply {
    /// Resolve to the full text, concatenating streamed chunks.
    pub async fn collect(self) -> Result<String, BackendError> {
        match self {
            Self::Complete(text) => Ok(text),
            Self::Stream(mut stream) => {
                let mut out = String::new();
                while let Some(chunk) = stream.next().await {
                    out.push_str(&chunk?);
                }
                Ok(out)
            }
        }
    }
}

impl std::fmt::Debug for BackendReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Errors a backend call can end with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {backend} failed: {message}")]
    Failure { backend: String, message: String },

    #[error("Backend call timed out")]
    Timeout,

    #[error("Backend call cancelled")]
    Cancelled,

    #[error("Unknown backend: {name}")]
    Unknown { name: String },
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        request: BackendRequest,
        options: InvokeOptions,
    ) -> Result<BackendReply, BackendError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::stream;

    use super::*;

    #[tokio::test]
    async fn stream_reply_collects_in_order() {
        let chunks = vec![Ok("a".to_string()), Ok("b".to_string()), Ok("c".to_string())];
        let reply = BackendReply::Stream(Box::pin(stream::iter(chunks)));
        assert_eq!(reply.collect().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn stream_error_stops_collection() {
        let chunks = vec![
            Ok("a".to_string()),
            Err(BackendError::Failure {
                backend: "x".to_string(),
                message: "reset".to_string(),
            }),
            Ok("c".to_string()),
        ];
        let reply = BackendReply::Stream(Box::pin(stream::iter(chunks)));
        assert!(matches!(
            reply.collect().await,
            Err(BackendError::Failure { .. })
        ));
    }
}
