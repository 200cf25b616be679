//! ScriptedBackend - 台本どおりに断片を返す生成バックエンド
//!
//! API キーなしで動かすとき・テストで使います。
//! 失敗回数や途中切断、断片ごとの遅延を指定できます。

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};

use crate::domain::RelayError;
use crate::ports::{FragmentStream, GenerationBackend};

const INPUT_MARKER: &str = "User input: \"";

#[derive(Debug, Clone)]
pub enum Script {
    /// Always the same fragments.
    Fixed(Vec<String>),
    /// Echo the quoted user input back, one word per fragment.
    EchoInput,
}

pub struct ScriptedBackend {
    script: Script,
    failures_left: AtomicU32,
    failure: RelayError,
    fail_after_fragments: Option<usize>,
    fragment_delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            failures_left: AtomicU32::new(0),
            failure: RelayError::BackendUnavailable("scripted failure".into()),
            fail_after_fragments: None,
            fragment_delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn fixed<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Script::Fixed(fragments.into_iter().map(Into::into).collect()))
    }

    pub fn echo() -> Self {
        Self::new(Script::EchoInput)
    }

    /// Fail the first `count` calls with `error`, then follow the script.
    pub fn with_failures(mut self, count: u32, error: RelayError) -> Self {
        self.failures_left = AtomicU32::new(count);
        self.failure = error;
        self
    }

    pub fn always_failing(self, error: RelayError) -> Self {
        self.with_failures(u32::MAX, error)
    }

    /// Break the stream with `BackendUnavailable` after `count` fragments.
    pub fn fail_after_fragments(mut self, count: usize) -> Self {
        self.fail_after_fragments = Some(count);
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Number of `stream_completion` calls so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fragments_for(&self, instruction: &str) -> Vec<String> {
        match &self.script {
            Script::Fixed(fragments) => fragments.clone(),
            Script::EchoInput => echo_fragments(instruction),
        }
    }
}

fn echo_fragments(instruction: &str) -> Vec<String> {
    let input = instruction
        .lines()
        .find_map(|line| line.strip_prefix(INPUT_MARKER))
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(instruction);
    input.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn stream_completion(
        &self,
        _model_name: &str,
        instruction: &str,
    ) -> Result<FragmentStream, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                if left == 0 {
                    None
                } else if left == u32::MAX {
                    Some(left)
                } else {
                    Some(left - 1)
                }
            })
            .is_ok();
        if failing {
            return Err(self.failure.clone());
        }

        let mut items: Vec<Result<String, RelayError>> = self
            .fragments_for(instruction)
            .into_iter()
            .map(Ok)
            .collect();
        if let Some(count) = self.fail_after_fragments {
            items.truncate(count);
            items.push(Err(RelayError::BackendUnavailable(
                "stream interrupted".into(),
            )));
        }

        let delay = self.fragment_delay;
        let fragments = stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(fragments.boxed())
    }
}
