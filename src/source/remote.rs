//! Chat source backed by an external retrieval service.
//!
//! The service is expected to answer `GET {base}/chat?url=..&max_messages=..&timeout=..`
//! with newline-delimited JSON, one chat message per line, and to close the
//! response when the stream ends.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};

use super::{ChatMessage, ChatRequest, ChatSource, MessageStream};
use crate::error::SourceError;

/// Maximum error body retained from a failed response, in bytes.
const MAX_ERROR_BODY: usize = 512;

/// Longest NDJSON line accepted from the service, in bytes.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// HTTP client for a chat retrieval service speaking NDJSON.
#[derive(Debug, Clone)]
pub struct RemoteChatSource {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteChatSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatSource for RemoteChatSource {
    fn name(&self) -> &str {
        "remote"
    }

    async fn open(&self, request: &ChatRequest) -> Result<MessageStream, SourceError> {
        let mut query: Vec<(&str, String)> = vec![
            ("url", request.url.clone()),
            ("timeout", request.timeout.as_secs().to_string()),
        ];
        if let Some(max) = request.max_messages {
            query.push(("max_messages", max.to_string()));
        }

        let resp = self
            .client
            .get(format!("{}/chat", self.base_url))
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut body, MAX_ERROR_BODY);
            tracing::debug!(
                status = status.as_u16(),
                url = %request.url,
                "Chat source refused request"
            );
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(ndjson_messages(resp.bytes_stream()))
    }
}

/// Shorten `s` to at most `max` bytes without splitting a character.
fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

struct LineState<S> {
    chunks: Pin<Box<S>>,
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    done: bool,
}

impl<S> LineState<S> {
    fn fail(mut self, err: SourceError) -> Option<(Result<ChatMessage, SourceError>, Self)> {
        self.done = true;
        self.buf.clear();
        self.scanned = 0;
        Some((Err(err), self))
    }

    fn overlong(self) -> Option<(Result<ChatMessage, SourceError>, Self)> {
        let max = self.max_line;
        self.fail(SourceError::Decode(format!("line exceeds {max} bytes")))
    }
}

/// Decode a chunked byte stream of newline-delimited JSON into chat messages.
///
/// Blank lines are skipped. A transport or decode error, including a line
/// longer than [`MAX_LINE_BYTES`], is yielded once and ends the stream.
pub fn ndjson_messages<S, B, E>(chunks: S) -> MessageStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<SourceError> + Send + 'static,
{
    ndjson_messages_with_limit(chunks, MAX_LINE_BYTES)
}

fn ndjson_messages_with_limit<S, B, E>(chunks: S, max_line: usize) -> MessageStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<SourceError> + Send + 'static,
{
    let state = LineState {
        chunks: Box::pin(chunks),
        buf: Vec::new(),
        scanned: 0,
        max_line,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            let newline = state.buf[state.scanned..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = state.scanned + offset;
                    if end > state.max_line {
                        return state.overlong();
                    }
                    let line: Vec<u8> = state.buf.drain(..=end).collect();
                    state.scanned = 0;
                    match decode_line(&line) {
                        Some(item) => return Some((item, state)),
                        None => continue,
                    }
                }
                None => state.scanned = state.buf.len(),
            }

            if state.buf.len() > state.max_line {
                return state.overlong();
            }

            if state.done {
                if state.buf.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut state.buf);
                state.scanned = 0;
                match decode_line(&line) {
                    Some(item) => return Some((item, state)),
                    None => return None,
                }
            }

            match state.chunks.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return state.fail(e.into()),
                None => state.done = true,
            }
        }
    })
    .scan(false, |failed, item| {
        // Stop after the first error.
        if *failed {
            return futures::future::ready(None);
        }
        *failed = item.is_err();
        futures::future::ready(Some(item))
    })
    .boxed()
}

fn decode_line(line: &[u8]) -> Option<Result<ChatMessage, SourceError>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(SourceError::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, SourceError>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>, SourceError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn decodes_lines_split_across_chunks() {
        let stream = ndjson_messages(chunks(&[
            "{\"author\":\"a\",\"message\":\"one\"}\n{\"author\":\"b\",",
            "\"message\":\"two\"}\n\n",
            "{\"author\":\"c\",\"message\":\"three\"}",
        ]));
        let msgs: Vec<ChatMessage> = stream.map(|m| m.unwrap()).collect().await;
        let texts: Vec<&str> = msgs.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn decode_error_ends_stream() {
        let stream = ndjson_messages(chunks(&[
            "{\"author\":\"a\",\"message\":\"one\"}\nnot json\n",
            "{\"author\":\"c\",\"message\":\"three\"}\n",
        ]));
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(SourceError::Decode(_))));
    }

    #[tokio::test]
    async fn transport_error_is_yielded() {
        let parts: Vec<Result<Vec<u8>, SourceError>> = vec![
            Ok(b"{\"author\":\"a\",\"message\":\"one\"}\n".to_vec()),
            Err(SourceError::Request("reset".into())),
        ];
        let items: Vec<_> = ndjson_messages(stream::iter(parts)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(SourceError::Request(_))));
    }

    #[tokio::test]
    async fn overlong_line_is_a_decode_error() {
        let long = "x".repeat(64);
        let parts: Vec<Result<Vec<u8>, SourceError>> = vec![
            Ok(b"{\"author\":\"a\",\"message\":\"one\"}\n".to_vec()),
            Ok(long.as_bytes().to_vec()),
            Ok(long.as_bytes().to_vec()),
            Ok(b"\n{\"author\":\"b\",\"message\":\"two\"}\n".to_vec()),
        ];
        let items: Vec<_> = ndjson_messages_with_limit(stream::iter(parts), 100)
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        match &items[1] {
            Err(SourceError::Decode(reason)) => assert!(reason.contains("100 bytes")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlong_line_within_one_chunk_is_rejected() {
        let mut chunk = "y".repeat(200).into_bytes();
        chunk.push(b'\n');
        let parts: Vec<Result<Vec<u8>, SourceError>> = vec![Ok(chunk)];
        let items: Vec<_> = ndjson_messages_with_limit(stream::iter(parts), 100)
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(SourceError::Decode(_))));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut body = "a".repeat(511) + "\u{e9}\u{e9}\u{e9}";
        truncate_on_char_boundary(&mut body, 512);
        assert_eq!(body.len(), 511);
        assert!(body.chars().all(|c| c == 'a'));

        let mut short = "caf\u{e9}".to_string();
        truncate_on_char_boundary(&mut short, 512);
        assert_eq!(short, "caf\u{e9}");
    }

    #[tokio::test]
    async fn multibyte_error_body_keeps_status() {
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;

        let body = "a".repeat(511) + &"\u{e9}".repeat(20);
        let app = Router::new().route(
            "/chat",
            get(move || async move { (StatusCode::FORBIDDEN, body) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source = RemoteChatSource::new(format!("http://127.0.0.1:{port}"));
        let request = ChatRequest {
            url: "https://twitch.tv/example".to_string(),
            max_messages: None,
            timeout: std::time::Duration::from_secs(5),
        };
        match source.open(&request).await {
            Err(SourceError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert!(body.len() <= MAX_ERROR_BODY);
                assert!(body.starts_with("aaa"));
            }
            Err(other) => panic!("expected status error, got {other}"),
            Ok(_) => panic!("expected status error, got a stream"),
        }
    }

    #[test]
    fn base_url_is_normalised() {
        let source = RemoteChatSource::new("http://localhost:9000/");
        assert_eq!(source.base_url(), "http://localhost:9000");
    }
}
