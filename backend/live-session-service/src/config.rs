//! Configuration for Live Session Service
//!
//! Every component takes its own typed section with a `Default`, so the core
//! can be built in tests without touching the environment. `Config::from_env`
//! assembles all sections for the binary.

use crate::error::AppError;
use crate::models::Variant;
use dotenvy::dotenv;
use resilience::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL handed to broadcasters, the key is appended
    pub public_ingest_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            public_ingest_base_url: "http://localhost:8090/live".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait after an ingest disconnect before the session ends
    pub ingest_grace_period: Duration,
    /// Random bytes per stream key (hex-encoded, so keys are twice as long)
    pub stream_key_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ingest_grace_period: Duration::from_secs(5),
            stream_key_bytes: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Chunks buffered between the gateway and the segmenter
    pub queue_capacity: usize,
    /// Longest a chunk may wait for queue space before it is dropped
    pub throttle_wait: Duration,
    /// Raw bytes that make up one input segment
    pub input_segment_bytes: usize,
    /// Nominal media duration of one input segment
    pub input_segment_duration: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            throttle_wait: Duration::from_secs(2),
            input_segment_bytes: 1024 * 1024,
            input_segment_duration: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub variants: Vec<Variant>,
    /// Jobs running at once across all sessions
    pub max_concurrency: usize,
    /// Jobs admitted but still waiting for an executor slot; the segmenter
    /// stalls once this many are queued, which backs ingest up
    pub max_pending_jobs: usize,
    /// `max_retries` counts retries after the first attempt
    pub retry: RetryConfig,
    /// How long finished job records are kept once their session ends
    pub job_retention: Duration,
    /// Submit a thumbnail job every N input segments; 0 disables thumbnails
    pub thumbnail_every: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            variants: vec![
                Variant::new("1080p"),
                Variant::new("720p"),
                Variant::new("480p"),
            ],
            max_concurrency: 8,
            max_pending_jobs: 64,
            // three attempts in total
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                ..Default::default()
            },
            thumbnail_every: 5,
            job_retention: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum entries kept in a manifest window
    pub window_segments: usize,
    /// Maximum media duration kept in a manifest window
    pub window_duration: Duration,
    /// How long a missing slot may block later segments before it is skipped
    pub gap_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a finalized manifest stays readable before its track is dropped
    pub closed_retention: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            window_segments: 6,
            window_duration: Duration::from_secs(60),
            gap_timeout: Duration::from_secs(4),
            sweep_interval: Duration::from_millis(500),
            closed_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Events buffered per subscriber before it is disconnected as slow
    pub subscriber_buffer: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Cached memberships older than this are reloaded from the metadata store
    pub cache_ttl: Duration,
    /// Messages kept per channel for pin/delete lookups
    pub history_limit: usize,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            history_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub ingest: IngestConfig,
    pub dispatcher: DispatcherConfig,
    pub publisher: PublisherConfig,
    pub fanout: FanoutConfig,
    pub moderation: ModerationConfig,
    pub log_format: LogFormat,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{name} has invalid value {raw:?}"))),
        _ => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, AppError> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_variants(value: &str) -> Vec<Variant> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(Variant::new)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let defaults = Config::default();

        let server = ServerConfig {
            host: env::var("HOST").unwrap_or(defaults.server.host),
            port: parse_var("PORT", defaults.server.port)?,
            public_ingest_base_url: env::var("PUBLIC_INGEST_BASE_URL")
                .unwrap_or(defaults.server.public_ingest_base_url),
        };

        let session = SessionConfig {
            ingest_grace_period: millis_var(
                "INGEST_GRACE_PERIOD_MS",
                defaults.session.ingest_grace_period,
            )?,
            stream_key_bytes: parse_var("STREAM_KEY_BYTES", defaults.session.stream_key_bytes)?,
        };
        if session.stream_key_bytes < 16 {
            return Err(AppError::Config(
                "STREAM_KEY_BYTES must be at least 16".to_string(),
            ));
        }

        let ingest = IngestConfig {
            queue_capacity: parse_var("INGEST_QUEUE_CAPACITY", defaults.ingest.queue_capacity)?,
            throttle_wait: millis_var("INGEST_THROTTLE_WAIT_MS", defaults.ingest.throttle_wait)?,
            input_segment_bytes: parse_var(
                "INPUT_SEGMENT_BYTES",
                defaults.ingest.input_segment_bytes,
            )?,
            input_segment_duration: millis_var(
                "INPUT_SEGMENT_DURATION_MS",
                defaults.ingest.input_segment_duration,
            )?,
        };
        if ingest.queue_capacity == 0 || ingest.input_segment_bytes == 0 {
            return Err(AppError::Config(
                "INGEST_QUEUE_CAPACITY and INPUT_SEGMENT_BYTES must be positive".to_string(),
            ));
        }

        let variants = env::var("TRANSCODE_VARIANTS")
            .map(|v| parse_variants(&v))
            .unwrap_or(defaults.dispatcher.variants);
        if variants.is_empty() {
            return Err(AppError::Config(
                "TRANSCODE_VARIANTS must name at least one variant".to_string(),
            ));
        }
        let dispatcher = DispatcherConfig {
            variants,
            max_concurrency: parse_var(
                "TRANSCODE_MAX_CONCURRENCY",
                defaults.dispatcher.max_concurrency,
            )?
            .max(1),
            max_pending_jobs: parse_var(
                "TRANSCODE_MAX_PENDING_JOBS",
                defaults.dispatcher.max_pending_jobs,
            )?
            .max(1),
            retry: RetryConfig {
                max_retries: parse_var(
                    "TRANSCODE_MAX_RETRIES",
                    defaults.dispatcher.retry.max_retries,
                )?,
                initial_backoff: millis_var(
                    "TRANSCODE_INITIAL_BACKOFF_MS",
                    defaults.dispatcher.retry.initial_backoff,
                )?,
                max_backoff: millis_var(
                    "TRANSCODE_MAX_BACKOFF_MS",
                    defaults.dispatcher.retry.max_backoff,
                )?,
                ..defaults.dispatcher.retry
            },
            thumbnail_every: parse_var(
                "THUMBNAIL_EVERY_SEGMENTS",
                defaults.dispatcher.thumbnail_every,
            )?,
            job_retention: millis_var("JOB_RETENTION_MS", defaults.dispatcher.job_retention)?,
        };

        let publisher = PublisherConfig {
            window_segments: parse_var(
                "MANIFEST_WINDOW_SEGMENTS",
                defaults.publisher.window_segments,
            )?
            .max(1),
            window_duration: millis_var("MANIFEST_WINDOW_MS", defaults.publisher.window_duration)?,
            gap_timeout: millis_var("SEQUENCE_GAP_TIMEOUT_MS", defaults.publisher.gap_timeout)?,
            sweep_interval: millis_var(
                "GAP_SWEEP_INTERVAL_MS",
                defaults.publisher.sweep_interval,
            )?,
            closed_retention: millis_var(
                "MANIFEST_CLOSED_RETENTION_MS",
                defaults.publisher.closed_retention,
            )?,
        };

        let fanout = FanoutConfig {
            subscriber_buffer: parse_var(
                "CHAT_SUBSCRIBER_BUFFER",
                defaults.fanout.subscriber_buffer,
            )?
            .max(1),
        };

        let moderation = ModerationConfig {
            cache_ttl: millis_var("MEMBERSHIP_CACHE_TTL_MS", defaults.moderation.cache_ttl)?,
            history_limit: parse_var("CHAT_HISTORY_LIMIT", defaults.moderation.history_limit)?,
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            server,
            session,
            ingest,
            dispatcher,
            publisher,
            fanout,
            moderation,
            log_format,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
