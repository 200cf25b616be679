//! OpenAiBackend - OpenAI 互換 Chat Completions API のストリーミング呼び出し
//!
//! `stream: true` で POST し、SSE の `data:` 行を 1 行ずつ読んで
//! `choices[0].delta.content` を断片として流します。`data: [DONE]` で終了です。
//!
//! # エラー分類
//! - 429 → `BackendRateLimited`
//! - 接続エラー・その他の非 2xx → `BackendUnavailable`
//! - `[DONE]` を受け取る前に接続が閉じた → `BackendUnavailable`

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::domain::RelayError;
use crate::ports::{FragmentStream, GenerationBackend};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_OPENAI_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    async fn stream_completion(
        &self,
        model_name: &str,
        instruction: &str,
    ) -> Result<FragmentStream, RelayError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = model_name, "starting streaming completion");

        let body = json!({
            "model": model_name,
            "stream": true,
            "messages": [{ "role": "system", "content": instruction }],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::BackendUnavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::BackendRateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::BackendUnavailable(format!("{status}: {body}")));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(fragments(bytes))
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

fn fragments(bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> FragmentStream {
    let state = SseState {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                None => {
                    state.done = true;
                    let cut = RelayError::BackendUnavailable("stream ended before [DONE]".into());
                    return Some((Err(cut), state));
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(RelayError::BackendUnavailable(e.to_string())), state));
                }
                Some(Ok(chunk)) => match state.decoder.push(&chunk) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                SseEvent::Fragment(text) => state.pending.push_back(text),
                                SseEvent::Done => {
                                    state.done = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                },
            }
        }
    })
    .boxed()
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Fragment(String),
    Done,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Line-buffered SSE decoder; chunks may split lines anywhere.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, RelayError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(data) = line.strip_prefix("data:") else {
                // comments, event names, blank separators
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            let chunk: CompletionChunk = serde_json::from_str(data)?;
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .unwrap_or_default();
            if !content.is_empty() {
                events.push(SseEvent::Fragment(content));
            }
        }
        Ok(events)
    }
}
