// Streaming chat session against a running sidekick server
use crate::error::{Result, SidekickError};
use crate::sse::{data_payload, SseLineDecoder, DONE_SENTINEL};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Who authored a message in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One entry in the conversation transcript.
///
/// The id is assigned at creation and never changes. While `streaming` is
/// true the content only grows; once it is cleared the content is final for
/// that turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// True while more tokens are expected for this message.
    pub streaming: bool,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            streaming: false,
        }
    }

    fn streaming_placeholder(role: Role) -> Self {
        Self {
            streaming: true,
            ..Self::new(role, "")
        }
    }
}

/// Receives transcript updates as a turn progresses: the creation of both
/// messages, every in-order token append, and the finalizing update.
/// Implemented for any `FnMut(&ChatMessage)`.
pub trait ChatSink {
    fn message(&mut self, message: &ChatMessage);
}

impl<F: FnMut(&ChatMessage)> ChatSink for F {
    fn message(&mut self, message: &ChatMessage) {
        self(message)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ToolsResponse {
    #[serde(default)]
    tools: Vec<serde_json::Value>,
}

/// How a chat turn ended. HTTP and transport failures are rendered into the
/// transcript rather than surfaced as errors, so a failed turn never crashes
/// the session.
enum TurnEnd {
    Completed,
    RequestFailed { status: StatusCode, body: String },
    Transport(String),
}

/// A chat conversation against one server URL.
///
/// Holds the ordered transcript and the awaiting-response flag. One turn may
/// be in flight at a time; `send` takes `&mut self`, and a send while the
/// previous turn is still pending is rejected as a caller error.
pub struct ChatSession {
    server_url: String,
    username: Option<String>,
    client: Client,
    messages: Vec<ChatMessage>,
    awaiting_response: bool,
}

impl ChatSession {
    pub fn new(server_url: impl Into<String>) -> Self {
        // No global timeout: the response body is a long-lived token stream.
        // The connect timeout still bounds how long a dead server can hang a
        // turn before it is rendered as a transport failure.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            server_url: server_url.into(),
            username: None,
            client,
            messages: Vec::new(),
            awaiting_response: false,
        }
    }

    /// Identify the user in chat requests.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// The transcript, in conversation order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// True between turn start and turn finalization.
    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    /// Send one user turn and stream the assistant's reply.
    ///
    /// The user message and an empty assistant placeholder are appended to
    /// the transcript (and reported to the sink) before any network
    /// activity. Tokens are appended to the assistant message in wire order,
    /// one sink notification per token. The assistant message is finalized
    /// on every exit path; failures are embedded in its content instead of
    /// being returned as errors.
    pub async fn send(&mut self, text: &str, sink: &mut dyn ChatSink) -> Result<()> {
        if text.is_empty() {
            return Err(SidekickError::Chat(
                "message text must not be empty".to_string(),
            ));
        }
        if self.awaiting_response {
            return Err(SidekickError::Chat(
                "a turn is already in flight".to_string(),
            ));
        }
        self.awaiting_response = true;

        self.messages.push(ChatMessage::new(Role::User, text));
        sink.message(&self.messages[self.messages.len() - 1]);

        self.messages
            .push(ChatMessage::streaming_placeholder(Role::Assistant));
        let assistant_idx = self.messages.len() - 1;
        sink.message(&self.messages[assistant_idx]);

        let end = self.stream_turn(text, assistant_idx, sink).await;

        match end {
            TurnEnd::Completed => {}
            TurnEnd::RequestFailed { status, body } => {
                self.messages[assistant_idx].content =
                    format!("Error: {} {}", status.as_u16(), body);
            }
            TurnEnd::Transport(detail) => {
                let message = &mut self.messages[assistant_idx];
                if message.content.is_empty() {
                    message.content = format!("Connection error: {}", detail);
                } else {
                    message
                        .content
                        .push_str(&format!("\n[connection error: {}]", detail));
                }
            }
        }

        self.messages[assistant_idx].streaming = false;
        sink.message(&self.messages[assistant_idx]);
        self.awaiting_response = false;
        Ok(())
    }

    /// Fetch the tool definitions the server advertises.
    pub async fn list_tools(&self) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/tools", self.server_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SidekickError::Server(format!("Failed to fetch tools: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SidekickError::Server(format!(
                "Tools request failed ({}): {}",
                status, body
            )));
        }

        let payload: ToolsResponse = response
            .json()
            .await
            .map_err(|e| SidekickError::Server(format!("Invalid tools response: {}", e)))?;
        Ok(payload.tools)
    }

    async fn stream_turn(
        &mut self,
        text: &str,
        assistant_idx: usize,
        sink: &mut dyn ChatSink,
    ) -> TurnEnd {
        let url = format!("{}/chat", self.server_url);
        let username = self.username.clone();
        tracing::debug!("Sending chat turn to {}", url);

        let request = ChatRequest {
            message: text,
            username: username.as_deref(),
        };
        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Chat request failed to reach the server: {}", e);
                return TurnEnd::Transport(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Chat request failed ({}): {}", status, body);
            return TurnEnd::RequestFailed { status, body };
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseLineDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("Chat stream error: {}", e);
                    return TurnEnd::Transport(e.to_string());
                }
            };
            for line in decoder.feed(&chunk) {
                match data_payload(&line) {
                    Some(token) if token == DONE_SENTINEL => return TurnEnd::Completed,
                    Some(token) => self.append_token(assistant_idx, token, sink),
                    None => {}
                }
            }
        }

        // The connection closed without the sentinel; the remainder may
        // still carry a final token.
        if let Some(line) = decoder.finish() {
            match data_payload(&line) {
                Some(token) if token == DONE_SENTINEL => {}
                Some(token) => self.append_token(assistant_idx, token, sink),
                None => {}
            }
        }
        TurnEnd::Completed
    }

    fn append_token(&mut self, assistant_idx: usize, token: &str, sink: &mut dyn ChatSink) {
        let message = &mut self.messages[assistant_idx];
        message.content.push_str(token);
        sink.message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_single_response_server(
        expected_path: &'static str,
        response_status: &'static str,
        response_body: &'static str,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let n = socket.read(&mut buf).await.expect("read");
            let req = String::from_utf8_lossy(&buf[..n]);
            let first_line = req.lines().next().unwrap_or("");
            assert!(
                first_line.contains(expected_path),
                "expected path {}, got request line {}",
                expected_path,
                first_line
            );
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                response_status,
                response_body.len(),
                response_body
            );
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write_all");
        });
        format!("http://{}", addr)
    }

    /// Serves `/chat` with a 200 and writes the given chunks with small
    /// pauses between them, then closes the connection.
    async fn spawn_stream_server(chunks: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.expect("read");
            let header =
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            socket.write_all(header.as_bytes()).await.expect("header");
            for chunk in chunks {
                socket.write_all(&chunk).await.expect("chunk");
                socket.flush().await.expect("flush");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        format!("http://{}", addr)
    }

    fn collecting_sink(updates: &mut Vec<(Role, String, bool)>) -> impl FnMut(&ChatMessage) + '_ {
        |message: &ChatMessage| {
            updates.push((message.role, message.content.clone(), message.streaming))
        }
    }

    #[tokio::test]
    async fn streams_tokens_in_order() {
        let url = spawn_stream_server(vec![
            b"data: Hel".to_vec(),
            b"lo, \ndata: ".to_vec(),
            b"world\ndata: [DONE]\n".to_vec(),
        ])
        .await;
        let mut session = ChatSession::new(url);
        let mut updates = Vec::new();
        {
            let mut sink = collecting_sink(&mut updates);
            session.send("hi", &mut sink).await.expect("send");
        }

        assert_eq!(
            updates,
            vec![
                (Role::User, "hi".to_string(), false),
                (Role::Assistant, String::new(), true),
                (Role::Assistant, "Hello, ".to_string(), true),
                (Role::Assistant, "Hello, world".to_string(), true),
                (Role::Assistant, "Hello, world".to_string(), false),
            ]
        );
        let assistant = &session.messages()[1];
        assert_eq!(assistant.content, "Hello, world");
        assert!(!assistant.streaming);
        assert!(!session.is_awaiting_response());
    }

    #[tokio::test]
    async fn done_sentinel_split_across_reads() {
        let url = spawn_stream_server(vec![
            b"data: Hel".to_vec(),
            b"lo\ndata: [".to_vec(),
            b"DONE]\n".to_vec(),
        ])
        .await;
        let mut session = ChatSession::new(url);
        let mut sink = |_: &ChatMessage| {};
        session.send("hi", &mut sink).await.expect("send");

        let assistant = &session.messages()[1];
        assert_eq!(assistant.content, "Hello");
        assert!(!assistant.streaming);
    }

    #[tokio::test]
    async fn multibyte_token_split_across_reads() {
        let token = "caff\u{e8} \u{1f980}";
        let bytes = format!("data: {}\ndata: [DONE]\n", token).into_bytes();
        // Split inside the two-byte e-grave.
        let url = spawn_stream_server(vec![bytes[..11].to_vec(), bytes[11..].to_vec()]).await;
        let mut session = ChatSession::new(url);
        let mut sink = |_: &ChatMessage| {};
        session.send("hi", &mut sink).await.expect("send");

        assert_eq!(session.messages()[1].content, token);
    }

    #[tokio::test]
    async fn empty_data_line_is_a_real_token() {
        let url = spawn_stream_server(vec![b"data: \ndata: x\ndata: [DONE]\n".to_vec()]).await;
        let mut session = ChatSession::new(url);
        let mut updates = Vec::new();
        {
            let mut sink = collecting_sink(&mut updates);
            session.send("hi", &mut sink).await.expect("send");
        }

        // Two creations, one empty-token update, one "x" update, finalize.
        assert_eq!(updates.len(), 5);
        assert_eq!(updates[2], (Role::Assistant, String::new(), true));
        assert_eq!(session.messages()[1].content, "x");
    }

    #[tokio::test]
    async fn non_data_lines_are_ignored() {
        let url = spawn_stream_server(vec![
            b": keep-alive\nevent: message\ndata: hi\ndata: [DONE]\n".to_vec(),
        ])
        .await;
        let mut session = ChatSession::new(url);
        let mut sink = |_: &ChatMessage| {};
        session.send("ping", &mut sink).await.expect("send");

        assert_eq!(session.messages()[1].content, "hi");
    }

    #[tokio::test]
    async fn connection_close_without_sentinel_finalizes() {
        let url = spawn_stream_server(vec![b"data: partial\n".to_vec()]).await;
        let mut session = ChatSession::new(url);
        let mut sink = |_: &ChatMessage| {};
        session.send("hi", &mut sink).await.expect("send");

        let assistant = &session.messages()[1];
        assert_eq!(assistant.content, "partial");
        assert!(!assistant.streaming);
        assert!(!session.is_awaiting_response());
    }

    #[tokio::test]
    async fn http_error_is_rendered_into_the_transcript() {
        let url =
            spawn_single_response_server("/chat", "500 Internal Server Error", "boom").await;
        let mut session = ChatSession::new(url);
        let mut sink = |_: &ChatMessage| {};
        session.send("hi", &mut sink).await.expect("send");

        let assistant = &session.messages()[1];
        assert_eq!(assistant.content, "Error: 500 boom");
        assert!(!assistant.streaming);
        assert!(!session.is_awaiting_response());
    }

    #[tokio::test]
    async fn unreachable_server_is_rendered_into_the_transcript() {
        // Bind and drop to get a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        drop(listener);

        let mut session = ChatSession::new(format!("http://{}", addr));
        let mut sink = |_: &ChatMessage| {};
        session.send("ping", &mut sink).await.expect("send");

        let assistant = &session.messages()[1];
        assert!(
            assistant.content.starts_with("Connection error:"),
            "unexpected content: {}",
            assistant.content
        );
        assert!(!assistant.streaming);
        assert!(!session.is_awaiting_response());
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let mut session = ChatSession::new("http://127.0.0.1:1");
        let mut sink = |_: &ChatMessage| {};
        let err = session.send("", &mut sink).await.expect_err("should reject");
        assert!(matches!(err, SidekickError::Chat(_)));
        assert!(session.messages().is_empty());
        assert!(!session.is_awaiting_response());
    }

    #[tokio::test]
    async fn user_and_assistant_ids_are_distinct_and_stable() {
        let url = spawn_stream_server(vec![b"data: ok\ndata: [DONE]\n".to_vec()]).await;
        let mut session = ChatSession::new(url).with_username("dev");
        let mut ids = Vec::new();
        {
            let mut sink =
                |message: &ChatMessage| ids.push(message.id);
            session.send("hi", &mut sink).await.expect("send");
        }

        assert_ne!(ids[0], ids[1]);
        // Every assistant update carries the placeholder's id.
        assert!(ids[1..].iter().all(|id| *id == ids[1]));
        assert_eq!(session.messages()[0].id, ids[0]);
        assert_eq!(session.messages()[1].id, ids[1]);
    }

    #[tokio::test]
    async fn list_tools_returns_definitions() {
        let url = spawn_single_response_server(
            "/tools",
            "200 OK",
            r#"{"tools":[{"name":"issues_list"},{"name":"pipelines_list"}]}"#,
        )
        .await;
        let session = ChatSession::new(url);
        let tools = session.list_tools().await.expect("list_tools");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "issues_list");
    }
}
