//! Configuration file support.
//!
//! Credentials never live here. They come from the environment (optionally via
//! a `.env` file). Everything else has a sensible default, so running without
//! a config file is fine for local experiments.

use std::time::Duration;

use crate::{
    async_utils::io::read_json_or_toml,
    ocr::engines::{ProviderDescriptor, ProviderKind},
    prelude::*,
    rate_limit::RateLimit,
};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where we keep jobs, blobs and scheduled tasks.
    pub data_dir: PathBuf,

    /// Path to a TOML question bank.
    pub questions: Option<PathBuf>,

    /// OCR settings.
    pub ocr: OcrConfig,

    /// Pipeline settings.
    pub pipeline: PipelineConfig,

    /// Submission admission control.
    pub rate_limit: AdmissionConfig,

    /// Language model settings.
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("answer-eval-data"),
            questions: None,
            ocr: OcrConfig::default(),
            pipeline: PipelineConfig::default(),
            rate_limit: AdmissionConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Config {
    /// Load our config from `path`, or use the defaults.
    #[instrument(level = "debug")]
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => read_json_or_toml::<Config>(path)
                .await
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check for values which parse but make no sense.
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ocr.min_confidence) {
            return Err(anyhow!(
                "ocr.min_confidence must be between 0.0 and 1.0, got {}",
                self.ocr.min_confidence
            ));
        }
        if self.ocr.attempt_timeout_ms == 0 {
            return Err(anyhow!("ocr.attempt_timeout_ms must be positive"));
        }
        // The slowest stages are text extraction, which may try every
        // provider, and LLM scoring.
        let longest_stage_ms = self.ocr.attempt_timeout_ms
            * self.ocr.providers.len().max(1) as u64
            + self.llm.timeout_secs * 1000;
        let orphan_after_ms = u64::from(self.pipeline.orphan_after_minutes) * 60_000;
        if orphan_after_ms <= longest_stage_ms {
            return Err(anyhow!(
                "pipeline.orphan_after_minutes must be longer than the slowest stage ({} ms)",
                longest_stage_ms
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(anyhow!("rate_limit.window_ms must be positive"));
        }
        Ok(())
    }
}

/// OCR settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrConfig {
    /// Stop trying providers once one reports at least this confidence.
    pub min_confidence: f32,

    /// How long each provider gets before we give up on it.
    pub attempt_timeout_ms: u64,

    /// Language used when a submission doesn't specify one.
    pub default_language: String,

    /// Our providers. Order doesn't matter; `priority` does.
    pub providers: Vec<ProviderDescriptor>,
}

impl OcrConfig {
    /// The per-provider timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        let provider = |name: &str, kind, priority| ProviderDescriptor {
            name: name.to_owned(),
            kind,
            supported_languages: vec![],
            max_payload_bytes: None,
            priority,
            rate_limit: None,
            model: None,
        };
        Self {
            min_confidence: 0.7,
            attempt_timeout_ms: 30_000,
            default_language: "en".to_owned(),
            providers: vec![
                ProviderDescriptor {
                    // Synchronous Textract calls are limited to 10 MB.
                    max_payload_bytes: Some(10 * 1024 * 1024),
                    ..provider("textract", ProviderKind::Textract, 10)
                },
                provider("google_vision", ProviderKind::GoogleVision, 20),
                provider("llm", ProviderKind::Llm, 30),
                provider("tesseract", ProviderKind::Tesseract, 40),
            ],
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Images with a quality score below this are enhanced automatically.
    pub enhancement_threshold: f64,

    /// The largest image we accept.
    pub max_upload_bytes: usize,

    /// How long after completion we delete uploaded blobs.
    pub cleanup_delay_hours: u32,

    /// A recovery sweep fails unfinished jobs with no checkpoint in this many
    /// minutes. Running jobs checkpoint at every stage, so this only needs to
    /// exceed the longest single stage.
    pub orphan_after_minutes: u32,
}

impl PipelineConfig {
    /// [`Self::orphan_after_minutes`] as a duration.
    pub fn orphan_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.orphan_after_minutes))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enhancement_threshold: 70.0,
            max_upload_bytes: 10 * 1024 * 1024,
            cleanup_delay_hours: 24,
            orphan_after_minutes: 30,
        }
    }
}

/// Fixed-window admission control for submissions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Submissions allowed per subject per window.
    pub max_requests: usize,

    /// The window length.
    pub window_ms: u64,
}

impl AdmissionConfig {
    /// The window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window_ms: 60_000,
        }
    }
}

/// Language model settings, shared by the scorers and the vision OCR provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// The model to use.
    pub model: String,

    /// A timeout, in seconds, for the LLM to return a complete response.
    pub timeout_secs: u64,

    /// An optional limit on outbound requests, like `"60/m"`.
    pub rate_limit: Option<RateLimit>,
}

impl LlmConfig {
    /// The timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_owned(),
            timeout_secs: 60,
            rate_limit: None,
        }
    }
}
