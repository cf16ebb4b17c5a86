//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use super::{ConversationHandle, ConversationRuntime, RuntimeSettings};
use crate::conversation::Conversation;
use crate::llm::{ByteStream, ChatRequest, ChatResponse, LlmError, LlmService};
use crate::reducer::{Change, ConversationReducer, ConversationUpdate};
use crate::state_machine::{ConvContext, ExchangeOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Mock LLM Service
// ============================================================================

/// One scripted reply
pub enum MockReply {
    /// Body chunks delivered as-is; `hold_open` keeps the body pending
    /// after the last chunk instead of ending it
    Stream {
        chunks: Vec<Result<Bytes, LlmError>>,
        hold_open: bool,
    },
    OpenError(LlmError),
    Complete(Result<ChatResponse, LlmError>),
}

/// Mock LLM service that replays queued replies
pub struct MockLlmService {
    replies: Mutex<VecDeque<MockReply>>,
    has_credential: bool,
    /// Record of all requests made
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmService {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            has_credential: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn without_credential() -> Self {
        Self {
            has_credential: false,
            ..Self::new()
        }
    }

    pub fn queue(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Queue a complete event stream carrying these deltas
    pub fn queue_deltas(&self, deltas: &[&str]) {
        let mut chunks: Vec<_> = deltas.iter().map(|d| Ok(Bytes::from(sse(d)))).collect();
        chunks.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
        self.queue(MockReply::Stream {
            chunks,
            hold_open: false,
        });
    }

    /// Queue a stream that delivers these deltas and then never ends
    pub fn queue_deltas_then_hang(&self, deltas: &[&str]) {
        self.queue(MockReply::Stream {
            chunks: deltas.iter().map(|d| Ok(Bytes::from(sse(d)))).collect(),
            hold_open: true,
        });
    }

    /// Queue a stream that delivers these deltas and then fails to read
    pub fn queue_deltas_then_fail(&self, deltas: &[&str], error: LlmError) {
        let mut chunks: Vec<_> = deltas.iter().map(|d| Ok(Bytes::from(sse(d)))).collect();
        chunks.push(Err(error));
        self.queue(MockReply::Stream {
            chunks,
            hold_open: false,
        });
    }

    pub fn queue_response(&self, content: &str) {
        self.queue(MockReply::Complete(Ok(ChatResponse {
            content: content.to_string(),
            usage: None,
        })));
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self, request: &ChatRequest) -> Option<MockReply> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies.lock().unwrap().pop_front()
    }
}

impl Default for MockLlmService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        match self.next_reply(request) {
            Some(MockReply::Complete(result)) => result,
            _ => Err(LlmError::network("No mock response queued")),
        }
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, LlmError> {
        match self.next_reply(request) {
            Some(MockReply::Stream { chunks, hold_open }) => {
                let body = stream::iter(chunks);
                if hold_open {
                    Ok(Box::pin(body.chain(stream::pending())))
                } else {
                    Ok(Box::pin(body))
                }
            }
            Some(MockReply::OpenError(e)) => Err(e),
            _ => Err(LlmError::network("No mock stream queued")),
        }
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }

    fn has_credential(&self) -> bool {
        self.has_credential
    }
}

/// One SSE data line carrying `text` as a delta
pub fn sse(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": text}}]})
    )
}

// ============================================================================
// In-Memory Collaborators
// ============================================================================

/// Snapshot store that keeps every snapshot it is given
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<Vec<Conversation>>,
}

impl MemoryStore {
    pub fn snapshots(&self) -> Vec<Conversation> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Conversation> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save_snapshot(&self, conversation: &Conversation) -> Result<(), String> {
        self.snapshots.lock().unwrap().push(conversation.clone());
        Ok(())
    }
}

/// Image host that hands out predictable URLs
pub struct MockImageHost;

#[async_trait]
impl ImageHost for MockImageHost {
    async fn resolve(&self, path: &Path) -> Result<String, String> {
        path.file_name()
            .map(|name| format!("https://images.test/{}", name.to_string_lossy()))
            .ok_or_else(|| format!("{} has no file name", path.display()))
    }
}

// ============================================================================
// Test Runtime
// ============================================================================

pub struct TestRuntime {
    pub handle: ConversationHandle,
    pub storage: Arc<MemoryStore>,
    pub llm: Arc<MockLlmService>,
    pub updates: broadcast::Receiver<ConversationUpdate>,
}

impl TestRuntime {
    pub fn new(llm: MockLlmService) -> Self {
        Self::with_settings(llm, RuntimeSettings::default())
    }

    pub fn with_settings(llm: MockLlmService, settings: RuntimeSettings) -> Self {
        let context = ConvContext::new("test-conv", "user-1", "mock-model").with_credential(llm.has_credential());
        let reducer = ConversationReducer::new(context, Conversation::new("test-conv", "user-1", Utc::now()));

        let storage = Arc::new(MemoryStore::default());
        let llm = Arc::new(llm);
        let handle = ConversationRuntime::spawn(
            reducer,
            storage.clone(),
            llm.clone(),
            settings,
            Arc::new(MockImageHost),
        );
        let updates = handle.subscribe();

        Self {
            handle,
            storage,
            llm,
            updates,
        }
    }

    /// Wait for the next update that ends an exchange
    pub async fn wait_for_outcome(&mut self, timeout: Duration) -> Option<ExchangeOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.updates.recv()).await {
                Ok(Ok(update)) => {
                    if update.outcome.is_some() {
                        return update.outcome;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    /// Wait until `count` deltas have been applied
    pub async fn wait_for_deltas(&mut self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = 0;
        while seen < count {
            match tokio::time::timeout_at(deadline, self.updates.recv()).await {
                Ok(Ok(update)) => {
                    seen += update
                        .changes
                        .iter()
                        .filter(|c| matches!(c, Change::DeltaApplied { .. }))
                        .count();
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Message, Role};
    use crate::error::ExchangeErrorKind;
    use crate::llm::{ChatMessage, ChatRole};
    use crate::runtime::executor::build_chat_request;
    use crate::runtime::SubmitError;
    use crate::state_machine::{ExchangeId, TransitionError};

    const WAIT: Duration = Duration::from_secs(2);

    fn text(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[tokio::test]
    async fn test_mock_llm_service() {
        let mock = MockLlmService::new();
        mock.queue_response("Hello");

        let request = ChatRequest {
            messages: vec![ChatMessage::user("Hi")],
            user: None,
        };
        assert_eq!(mock.complete(&request).await.unwrap().content, "Hello");
        // Nothing queued anymore
        assert!(mock.complete(&request).await.is_err());
        assert_eq!(mock.recorded_requests().len(), 2);
    }

    /// Integration test: streamed answer lands as one assistant message
    #[tokio::test]
    async fn test_streamed_response() {
        let llm = MockLlmService::new();
        llm.queue_deltas(&["Hi", " there"]);

        let mut rt = TestRuntime::new(llm);
        let exchange = rt.handle.submit(text("Hello"), None).await.unwrap();
        assert_eq!(exchange, ExchangeId(1));

        assert_eq!(rt.wait_for_outcome(WAIT).await, Some(ExchangeOutcome::Completed));

        let conv = rt.handle.snapshot().await.unwrap().conversation;
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(conv.messages()[1].role, Role::Assistant);
        assert_eq!(conv.messages()[1].text(), "Hi there");
        assert_eq!(conv.preview(), "Hi there");

        // Snapshot after the user message, then after the answer
        let snapshots = rt.storage.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].messages().len(), 1);
        assert_eq!(snapshots[1].messages()[1].text(), "Hi there");

        let requests = rt.llm.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages, vec![ChatMessage::user("Hello")]);
        assert_eq!(requests[0].user.as_deref(), Some("user-1"));
    }

    /// Integration test: history is sent with every request
    #[tokio::test]
    async fn test_second_exchange_carries_history() {
        let llm = MockLlmService::new();
        llm.queue_deltas(&["First"]);
        llm.queue_deltas(&["Second"]);

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("one"), None).await.unwrap();
        assert!(rt.wait_for_outcome(WAIT).await.is_some());
        let exchange = rt.handle.submit(text("two"), None).await.unwrap();
        assert_eq!(exchange, ExchangeId(2));
        assert!(rt.wait_for_outcome(WAIT).await.is_some());

        let roles: Vec<ChatRole> = rt.llm.recorded_requests()[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant, ChatRole::User]);
    }

    /// Integration test: cancel keeps what was streamed so far
    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let llm = MockLlmService::new();
        llm.queue_deltas_then_hang(&["Once upon", " a time"]);

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("Tell me a story"), None).await.unwrap();
        assert!(rt.wait_for_deltas(2, WAIT).await);

        rt.handle.cancel().await.unwrap();
        assert_eq!(
            rt.wait_for_outcome(WAIT).await,
            Some(ExchangeOutcome::Cancelled { partial_kept: true })
        );

        let conv = rt.handle.snapshot().await.unwrap().conversation;
        assert_eq!(conv.messages()[1].text(), "Once upon a time");
        assert!(conv.in_progress().is_none());
        assert_eq!(rt.storage.last().unwrap().messages().len(), 2);

        assert!(matches!(
            rt.handle.cancel().await,
            Err(SubmitError::Rejected(TransitionError::NothingToCancel))
        ));
    }

    /// Integration test: a request that cannot be opened leaves the user message
    #[tokio::test]
    async fn test_open_failure_is_retryable() {
        let llm = MockLlmService::new();
        llm.queue(MockReply::OpenError(LlmError::server_error("Server error: 502")));
        llm.queue_deltas(&["Back online"]);

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("Hello"), None).await.unwrap();

        let outcome = rt.wait_for_outcome(WAIT).await.unwrap();
        match &outcome {
            ExchangeOutcome::Failed { error, partial_kept } => {
                assert_eq!(error.kind, ExchangeErrorKind::NetworkFailure);
                assert!(!partial_kept);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(outcome.retry_available());
        assert_eq!(rt.handle.snapshot().await.unwrap().conversation.messages().len(), 1);

        // Conversation remains usable
        rt.handle.submit(text("Hello?"), None).await.unwrap();
        assert_eq!(rt.wait_for_outcome(WAIT).await, Some(ExchangeOutcome::Completed));
        assert_eq!(rt.handle.snapshot().await.unwrap().conversation.messages()[2].text(), "Back online");
    }

    #[tokio::test]
    async fn test_refused_key_is_not_retryable() {
        let llm = MockLlmService::new();
        llm.queue(MockReply::OpenError(LlmError::from_status(401, "invalid api key")));

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("Hello"), None).await.unwrap();

        let outcome = rt.wait_for_outcome(WAIT).await.unwrap();
        match &outcome {
            ExchangeOutcome::Failed { error, .. } => {
                assert_eq!(error.kind, ExchangeErrorKind::ConfigurationMissing);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!outcome.retry_available());
    }

    /// Integration test: a read failure mid-stream keeps the partial answer
    #[tokio::test]
    async fn test_read_failure_keeps_partial() {
        let llm = MockLlmService::new();
        llm.queue_deltas_then_fail(&["Partial"], LlmError::network("connection reset"));

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("Hello"), None).await.unwrap();

        match rt.wait_for_outcome(WAIT).await {
            Some(ExchangeOutcome::Failed { error, partial_kept }) => {
                assert_eq!(error.kind, ExchangeErrorKind::DecodeFailure);
                assert!(partial_kept);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(rt.handle.snapshot().await.unwrap().conversation.messages()[1].text(), "Partial");
    }

    /// Integration test: malformed frames are skipped without failing
    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let llm = MockLlmService::new();
        let body = format!("{}data: {{not json\n\n{}data: [DONE]\n\n", sse("one"), sse(" two"));
        llm.queue(MockReply::Stream {
            chunks: vec![Ok(Bytes::from(body))],
            hold_open: false,
        });

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("Hello"), None).await.unwrap();

        assert_eq!(rt.wait_for_outcome(WAIT).await, Some(ExchangeOutcome::Completed));
        assert_eq!(rt.handle.snapshot().await.unwrap().conversation.messages()[1].text(), "one two");
    }

    /// Integration test: non-streaming fallback
    #[tokio::test]
    async fn test_non_streaming_fallback() {
        let llm = MockLlmService::new();
        llm.queue_response("Hello back");

        let settings = RuntimeSettings {
            stream: false,
            timeout: None,
        };
        let mut rt = TestRuntime::with_settings(llm, settings);
        rt.handle.submit(text("Hello"), None).await.unwrap();

        assert_eq!(rt.wait_for_outcome(WAIT).await, Some(ExchangeOutcome::Completed));
        assert_eq!(rt.handle.snapshot().await.unwrap().conversation.messages()[1].text(), "Hello back");
    }

    /// Integration test: deadline takes the cancellation path
    #[tokio::test]
    async fn test_timeout() {
        let llm = MockLlmService::new();
        llm.queue_deltas_then_hang(&[]);

        let settings = RuntimeSettings {
            stream: true,
            timeout: Some(Duration::from_millis(50)),
        };
        let mut rt = TestRuntime::with_settings(llm, settings);
        rt.handle.submit(text("Hello"), None).await.unwrap();

        assert_eq!(
            rt.wait_for_outcome(WAIT).await,
            Some(ExchangeOutcome::TimedOut { partial_kept: false })
        );
        assert_eq!(rt.handle.snapshot().await.unwrap().conversation.messages().len(), 1);
    }

    /// Integration test: one exchange at a time
    #[tokio::test]
    async fn test_busy_rejects_second_submission() {
        let llm = MockLlmService::new();
        llm.queue_deltas_then_hang(&["Thinking"]);

        let mut rt = TestRuntime::new(llm);
        rt.handle.submit(text("first"), None).await.unwrap();
        assert!(rt.wait_for_deltas(1, WAIT).await);

        let result = rt.handle.submit(text("second"), None).await;
        assert!(matches!(result, Err(SubmitError::Rejected(TransitionError::Busy))));

        let conv = rt.handle.snapshot().await.unwrap().conversation;
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(conv.in_progress().map(Message::text), Some("Thinking"));
        assert_eq!(rt.llm.recorded_requests().len(), 1);
    }

    /// Integration test: no credential, nothing sent
    #[tokio::test]
    async fn test_configuration_missing() {
        let rt = TestRuntime::new(MockLlmService::without_credential());

        let result = rt.handle.submit(text("Hello"), None).await;
        assert!(matches!(
            result,
            Err(SubmitError::Rejected(TransitionError::ConfigurationMissing))
        ));
        assert!(rt.llm.recorded_requests().is_empty());
        assert!(rt.handle.snapshot().await.unwrap().conversation.messages().is_empty());
        assert!(rt.storage.snapshots().is_empty());
    }

    /// Integration test: images are resolved before the message is built
    #[tokio::test]
    async fn test_image_is_resolved_to_url() {
        let llm = MockLlmService::new();
        llm.queue_deltas(&["A cat."]);

        let mut rt = TestRuntime::new(llm);
        rt.handle
            .submit(None, Some(Path::new("/tmp/cat.png")))
            .await
            .unwrap();
        assert!(rt.wait_for_outcome(WAIT).await.is_some());

        let conv = rt.handle.snapshot().await.unwrap().conversation;
        assert_eq!(conv.messages()[0].content, None);
        assert_eq!(
            conv.messages()[0].image_ref.as_deref(),
            Some("https://images.test/cat.png")
        );
        assert_eq!(
            rt.llm.recorded_requests()[0].messages,
            vec![ChatMessage::user("https://images.test/cat.png")]
        );
    }

    #[test]
    fn test_chat_request_skips_empty_messages() {
        let now = Utc::now();
        let mut conv = Conversation::new("c", "user-1", now);
        conv.push_finalized(Message::user(text("Hi"), None, now));
        conv.push_finalized(Message::assistant("", now));
        conv.push_finalized(Message::user(text("Look"), Some("https://images.test/a.png".to_string()), now));
        conv.begin_assistant(now);
        conv.append_delta("in progress");

        let request = build_chat_request(&conv, "owner-7");
        assert_eq!(request.user.as_deref(), Some("owner-7"));
        assert_eq!(
            request.messages,
            vec![
                ChatMessage::user("Hi"),
                ChatMessage::user("Look\nhttps://images.test/a.png"),
            ]
        );
    }
}
