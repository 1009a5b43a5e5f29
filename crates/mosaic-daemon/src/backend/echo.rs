//! Echo backend: replies with its input prefixed by `[echo]`.
//! Used for smoke tests and the default daemon configuration.

use async_trait::async_trait;
use futures_util::stream;

use super::{Backend, BackendError, BackendReply, BackendRequest, InvokeOptions};

#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    streaming: bool,
}

impl EchoBackend {
    pub const fn new() -> Self {
        Self { streaming: false }
    }

    /// Reply word by word as a stream.
    pub const fn streaming() -> Self {
        Self { streaming: true }
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn invoke(
        &self,
        request: BackendRequest,
        options: InvokeOptions,
    ) -> Result<BackendReply, BackendError> {
        if options.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let text = format!("[echo] {}", request.input);
        if !self.streaming {
            return Ok(BackendReply::Complete(text));
        }
        let chunks: Vec<Result<String, BackendError>> = text
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(BackendReply::Stream(Box::pin(stream::iter(chunks))))
    }
}
