//! CLI 引数 / 環境変数 → 検証済み設定
//!
//! すべての値は `--flag` でも環境変数でも渡せます（`.env` は main で読み込み済み）。

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use relay_core::app::{ControllerSettings, RetryPolicy};
use relay_core::config::{ConcurrencySettings, QueueSettings, RelayConfig};
use relay_core::domain::MAX_PARAMETER_VALUE;
use relay_core::impls::DEFAULT_OPENAI_BASE_URL;
use relay_core::ports::{DEFAULT_RESULT_PREFIX, DEFAULT_TASK_QUEUE};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "relay",
    version,
    about = "Run a dispatcher and a worker over an in-process broker and stream the results"
)]
pub struct CliArgs {
    /// Texts to submit. Each one becomes a task and is streamed to stdout.
    #[arg(default_value = "Hello")]
    pub inputs: Vec<String>,

    /// Style parameter as `scale=value` (0..=10). Repeatable, once per scale.
    #[arg(short, long = "param", value_name = "SCALE=VALUE")]
    pub params: Vec<String>,

    /// Model name recorded with the request and sent to the backend.
    #[arg(long, env = "MODEL_NAME", default_value = "gpt-4o-mini")]
    pub model: String,

    #[arg(long, env = "TASK_QUEUE", default_value_t = DEFAULT_TASK_QUEUE.to_string())]
    pub task_queue: String,

    /// Result channels are named `{prefix}{request_id}`.
    #[arg(long, env = "RESULT_QUEUE_PREFIX", default_value_t = DEFAULT_RESULT_PREFIX.to_string())]
    pub result_prefix: String,

    #[arg(long, env = "MIN_CONCURRENCY", default_value_t = 1)]
    pub min_concurrency: usize,

    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 8)]
    pub max_concurrency: usize,

    /// Defaults to `min_concurrency`.
    #[arg(long, env = "INITIAL_CONCURRENCY")]
    pub initial_concurrency: Option<usize>,

    #[arg(long, env = "CPU_LOW_THRESHOLD", default_value_t = 50.0)]
    pub cpu_low: f32,

    #[arg(long, env = "CPU_HIGH_THRESHOLD", default_value_t = 85.0)]
    pub cpu_high: f32,

    #[arg(long, env = "MEMORY_LOW_THRESHOLD", default_value_t = 50.0)]
    pub memory_low: f32,

    #[arg(long, env = "MEMORY_HIGH_THRESHOLD", default_value_t = 85.0)]
    pub memory_high: f32,

    /// Grow only while more than this many tasks are waiting.
    #[arg(long, env = "QUEUE_GROW_THRESHOLD", default_value_t = 5)]
    pub depth_grow: usize,

    /// Shrink when fewer than this many tasks are waiting.
    #[arg(long, env = "QUEUE_SHRINK_THRESHOLD", default_value_t = 1)]
    pub depth_shrink: usize,

    #[arg(long, env = "CONTROLLER_INTERVAL_SECS", default_value_t = 5)]
    pub controller_interval_secs: u64,

    /// Run with a fixed capacity (no load sampling).
    #[arg(long, env = "DISABLE_CONTROLLER", default_value_t = false)]
    pub disable_controller: bool,

    /// Max wait for the next result envelope.
    #[arg(long, env = "STREAM_TIMEOUT_SECS", default_value_t = 60)]
    pub stream_timeout_secs: u64,

    /// Explanation cache TTL. `0` keeps entries forever.
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 3600)]
    pub cache_ttl_secs: u64,

    #[arg(long, env = "BACKEND_RETRY_ATTEMPTS", default_value_t = 3)]
    pub backend_retry_attempts: u32,

    #[arg(long, env = "BACKEND_RETRY_BASE_MS", default_value_t = 500)]
    pub backend_retry_base_ms: u64,

    /// Without a key the relay echoes the input back (offline mode).
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value_t = DEFAULT_OPENAI_BASE_URL.to_string())]
    pub openai_base_url: String,

    /// External broker address. Only the in-process broker ships, so setting this is an error.
    #[arg(long, env = "BROKER_URL", hide_env_values = true)]
    pub broker_url: Option<String>,

    /// External request/explanation store. Same restriction as `BROKER_URL`.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// External cache. Same restriction as `BROKER_URL`.
    #[arg(long, env = "CACHE_URL", hide_env_values = true)]
    pub cache_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub relay: RelayConfig,
    pub controller_enabled: bool,
    pub openai: Option<OpenAiSettings>,
    pub model: String,
    pub inputs: Vec<String>,
    pub params: Vec<(String, u8)>,
}

impl TryFrom<CliArgs> for CliConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        for (name, value) in [
            ("BROKER_URL", &args.broker_url),
            ("DATABASE_URL", &args.database_url),
            ("CACHE_URL", &args.cache_url),
        ] {
            if value.as_deref().is_some_and(|v| !v.trim().is_empty()) {
                bail!("{name} is set, but this binary only runs the in-process implementations");
            }
        }

        let params = args
            .params
            .iter()
            .map(|raw| parse_param(raw))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut seen = BTreeSet::new();
        for (scale, _) in &params {
            if !seen.insert(scale.as_str()) {
                bail!("parameter scale {scale:?} is given more than once");
            }
        }

        let relay = RelayConfig {
            queues: QueueSettings {
                task_queue: args.task_queue,
                result_prefix: args.result_prefix,
            },
            concurrency: ConcurrencySettings {
                min: args.min_concurrency,
                max: args.max_concurrency,
                initial: args.initial_concurrency.unwrap_or(args.min_concurrency),
            },
            controller: ControllerSettings {
                cpu_low: args.cpu_low,
                cpu_high: args.cpu_high,
                memory_low: args.memory_low,
                memory_high: args.memory_high,
                depth_grow: args.depth_grow,
                depth_shrink: args.depth_shrink,
                interval: Duration::from_secs(args.controller_interval_secs),
            },
            stream_timeout: Duration::from_secs(args.stream_timeout_secs),
            cache_ttl: (args.cache_ttl_secs > 0).then(|| Duration::from_secs(args.cache_ttl_secs)),
            backend_retry: RetryPolicy::new(
                Duration::from_millis(args.backend_retry_base_ms),
                2.0,
                args.backend_retry_attempts,
            ),
            ..RelayConfig::default()
        };
        relay.validate().context("invalid relay configuration")?;

        let openai = args
            .openai_api_key
            .filter(|key| !key.trim().is_empty())
            .map(|api_key| OpenAiSettings {
                api_key,
                base_url: args.openai_base_url,
            });

        if args.model.trim().is_empty() {
            bail!("MODEL_NAME must not be empty");
        }

        Ok(Self {
            relay,
            controller_enabled: !args.disable_controller,
            openai,
            model: args.model,
            inputs: args.inputs,
            params,
        })
    }
}

fn parse_param(raw: &str) -> anyhow::Result<(String, u8)> {
    let Some((scale, value)) = raw.split_once('=') else {
        bail!("parameter {raw:?} must look like scale=value");
    };
    let scale = scale.trim();
    if scale.is_empty() {
        bail!("parameter {raw:?} has an empty scale name");
    }
    let value: u8 = value
        .trim()
        .parse()
        .with_context(|| format!("parameter {raw:?} has a non-numeric value"))?;
    if value > MAX_PARAMETER_VALUE {
        bail!("parameter {raw:?} is out of range 0..={MAX_PARAMETER_VALUE}");
    }
    Ok((scale.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<CliConfig> {
        let args = CliArgs::try_parse_from(std::iter::once("relay").chain(argv.iter().copied()))?;
        CliConfig::try_from(args)
    }

    #[test]
    fn defaults_build_a_valid_config() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.inputs, vec!["Hello"]);
        assert_eq!(config.relay.concurrency.initial, 1);
        assert_eq!(config.relay.cache_ttl, Some(Duration::from_secs(3600)));
        assert!(config.controller_enabled);
    }

    #[test]
    fn params_are_parsed() {
        let config = parse(&["-p", "casualness=8", "--param", "humor = 3", "Hi there"]).unwrap();
        assert_eq!(
            config.params,
            vec![("casualness".to_string(), 8), ("humor".to_string(), 3)]
        );
        assert_eq!(config.inputs, vec!["Hi there"]);
    }

    #[test]
    fn out_of_range_param_is_rejected() {
        assert!(parse(&["-p", "casualness=11"]).is_err());
        assert!(parse(&["-p", "casualness"]).is_err());
    }

    #[test]
    fn duplicate_params_are_rejected() {
        let err = parse(&["-p", "humor=3", "-p", "casualness=8", "-p", "humor = 9"]).unwrap_err();
        assert!(err.to_string().contains("\"humor\""));
    }

    #[test]
    fn inverted_concurrency_bounds_are_rejected() {
        let err = parse(&["--min-concurrency", "4", "--max-concurrency", "2"]).unwrap_err();
        assert!(err.to_string().contains("invalid relay configuration"));
    }

    #[test]
    fn external_endpoints_are_refused() {
        let err = parse(&["--broker-url", "amqp://guest@localhost"]).unwrap_err();
        assert!(err.to_string().contains("BROKER_URL"));
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let config = parse(&["--cache-ttl-secs", "0"]).unwrap();
        assert_eq!(config.relay.cache_ttl, None);
    }
}
