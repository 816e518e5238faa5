//! The evaluation pipeline.
//!
//! [`EvaluationPipeline::submit`] validates a submission, creates a job record
//! and returns the job's ID straight away. The job then runs detached, moving
//! through each [`Stage`] in order and checkpointing its record as it goes.
//! Every job which starts ends in exactly one terminal [`JobStatus`]: errors
//! inside the run are caught once, at the top, and written into the record.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use futures::{FutureExt as _, try_join};
use keen_retry::{ExponentialJitter, RetryResult};
use regex::Regex;
use schemars::JsonSchema;
use tokio::time::Instant;

use crate::{
    async_utils::JoinWorker,
    config::{Config, PipelineConfig},
    imaging::{ImageProcessor, LocalImageProcessor, clamp_score},
    ocr::{OcrImage, OcrOptions, OcrOrchestrator, Priority, engines::ProviderRegistry},
    prelude::*,
    questions::{Question, QuestionBank, QuestionSource},
    rate_limit::{FixedWindowLimiter, RateLimited, WindowKey},
    retry::{resolve, retry_result_ok, try_potentially_transient},
    scoring::{
        ContentScorer, ExtractedAnswer, Feedback, FeedbackGenerator, FeedbackRequest,
        FeedbackSource, StructureScorer, analyze_handwriting, feedback::fallback_feedback,
        llm::LlmScorer, overall_score,
    },
    storage::{BlobStore, JobStore, Storage, StoreError},
};

pub mod cleanup;
pub mod job;
pub mod progress;

use self::{
    cleanup::CleanupScheduler,
    job::{EvaluationJob, JobId, JobStatus, Stage},
    progress::{ProgressReporter, ProgressSink},
};

/// Image formats we accept, as sniffed from the uploaded bytes.
const ACCEPTED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/tiff",
    "image/bmp",
];

/// A language tag like `"en"` or `"pt-BR"`.
static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{2,3}([-_][A-Za-z0-9]{2,8})*$").expect("failed to compile regex")
});

/// The rate limiter resource name for submissions.
const SUBMISSION_RESOURCE: &str = "evaluations";

/// Error message for jobs which were running when their process died.
pub const ORPHAN_ERROR: &str = "interrupted before completion";

/// A request to evaluate one answer.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub subject_id: String,
    pub question_id: String,
    pub filename: String,
    pub image: Vec<u8>,
    pub options: SubmitOptions,
}

/// Per-submission options.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct SubmitOptions {
    /// Try this OCR provider first.
    #[serde(default)]
    pub preferred_provider: Option<String>,

    /// Enhance the image even if its quality looks fine.
    #[serde(default)]
    pub enhance_image: bool,

    /// Favor OCR speed or accuracy.
    #[serde(default)]
    pub priority: Option<Priority>,

    /// Language of the answer, as an ISO 639-1 code.
    #[serde(default)]
    pub language: Option<String>,
}

/// Why a submission was refused. No job is created in any of these cases.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error("could not look up question: {0:#}")]
    QuestionSource(anyhow::Error),

    #[error("could not create job: {0}")]
    Persistence(#[from] StoreError),
}

/// An accepted submission.
pub struct Submission {
    /// The new job.
    pub job_id: JobId,

    /// Await this to wait for the job to finish. Dropping it leaves the job
    /// running.
    pub worker: JoinWorker,
}

/// Everything the pipeline talks to.
pub struct PipelineDeps {
    pub images: Arc<dyn ImageProcessor>,
    pub content: Arc<dyn ContentScorer>,
    pub structure: Arc<dyn StructureScorer>,
    pub feedback: Arc<dyn FeedbackGenerator>,
    pub blobs: Arc<dyn BlobStore>,
    pub jobs: Arc<dyn JobStore>,
    pub questions: Arc<dyn QuestionSource>,
    pub cleanup: Arc<CleanupScheduler>,
    pub ocr: OcrOrchestrator,
}

/// Shared state for the pipeline and its running jobs.
struct PipelineInner {
    deps: PipelineDeps,
    limiter: FixedWindowLimiter,
    config: PipelineConfig,
    default_language: String,

    /// Cancellation flags for jobs running in this process.
    running: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
}

/// Runs evaluation jobs.
#[derive(Clone)]
pub struct EvaluationPipeline {
    inner: Arc<PipelineInner>,
}

impl EvaluationPipeline {
    /// Create a pipeline from explicit collaborators.
    pub fn new(deps: PipelineDeps, config: &Config) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                deps,
                limiter: FixedWindowLimiter::new(
                    config.rate_limit.max_requests,
                    config.rate_limit.window(),
                ),
                config: config.pipeline.clone(),
                default_language: config.ocr.default_language.clone(),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a pipeline with our standard collaborators: local storage and
    /// image processing, configured OCR providers, and LLM scoring.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let storage = Storage::open(&config.data_dir).await?;
        let questions_path = config.questions.as_deref().ok_or_else(|| {
            anyhow!("No question bank configured (set `questions` in the config file)")
        })?;
        let questions = QuestionBank::load(questions_path).await?;
        if questions.is_empty() {
            warn!(path = ?questions_path, "Question bank is empty");
        } else {
            info!(questions = questions.len(), "Loaded question bank");
        }
        let registry = ProviderRegistry::from_config(&config.ocr, &config.llm).await?;
        let scorer = Arc::new(LlmScorer::new(&config.llm)?);
        let cleanup = Arc::new(CleanupScheduler::new(
            storage.tasks.clone(),
            storage.blobs.clone(),
        ));
        let deps = PipelineDeps {
            images: Arc::new(LocalImageProcessor),
            content: scorer.clone(),
            structure: scorer.clone(),
            feedback: scorer,
            blobs: storage.blobs,
            jobs: storage.jobs,
            questions: Arc::new(questions),
            cleanup,
            ocr: OcrOrchestrator::new(&registry, &config.ocr),
        };
        Ok(Self::new(deps, config))
    }

    /// Validate and admit a submission, then start evaluating it in the
    /// background. Returns as soon as the job record exists.
    #[instrument(level = "debug", skip_all, fields(subject = %request.subject_id, question = %request.question_id))]
    pub async fn submit(
        &self,
        request: SubmitRequest,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Submission, SubmitError> {
        let inner = &self.inner;
        let mime_type = inner.validate(&request)?;
        let question = inner
            .deps
            .questions
            .get_question(&request.question_id)
            .await
            .map_err(SubmitError::QuestionSource)?
            .ok_or_else(|| {
                SubmitError::Validation(format!("unknown question {:?}", request.question_id))
            })?;
        let window_key = WindowKey::new(&request.subject_id, SUBMISSION_RESOURCE);
        let admitted_at = std::time::Instant::now();
        inner.limiter.try_acquire_at(&window_key, admitted_at)?;

        let job = EvaluationJob::new(
            &request.subject_id,
            &request.question_id,
            &request.filename,
        );
        if let Err(err) = save_job(&*inner.deps.jobs, &job).await {
            // No job, so it shouldn't count against the subject.
            inner.limiter.refund(&window_key, admitted_at);
            return Err(err.into());
        }
        let job_id = job.id;
        info!(job = %job_id, "Created evaluation job");

        let cancel = Arc::new(AtomicBool::new(false));
        inner
            .running
            .lock()
            .expect("lock poisoned")
            .insert(job_id, cancel.clone());

        let run = JobRun {
            inner: inner.clone(),
            job,
            question,
            image: request.image,
            mime_type,
            options: request.options,
            progress: ProgressReporter::new(job_id, progress),
            cancel,
            started: Instant::now(),
        };
        let handle = tokio::spawn(run.execute());
        Ok(Submission {
            job_id,
            worker: JoinWorker::from_handle(handle),
        })
    }

    /// Look up a job's current record.
    pub async fn get_status(&self, job_id: JobId) -> Result<Option<EvaluationJob>> {
        Ok(self.inner.deps.jobs.get(job_id).await?)
    }

    /// Ask a running job to stop at its next stage boundary. Returns false if
    /// the job isn't running in this process.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.inner.running.lock().expect("lock poisoned").get(&job_id) {
            Some(flag) => {
                info!(job = %job_id, "Cancelling job");
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

impl PipelineInner {
    /// Check a submission, returning the sniffed MIME type of the image.
    fn validate(&self, request: &SubmitRequest) -> Result<String, SubmitError> {
        for (name, value) in [
            ("subject_id", &request.subject_id),
            ("question_id", &request.question_id),
            ("filename", &request.filename),
        ] {
            if value.trim().is_empty() {
                return Err(SubmitError::Validation(format!("{name} must not be empty")));
            }
        }
        if let Some(language) = &request.options.language
            && !LANGUAGE_TAG.is_match(language)
        {
            return Err(SubmitError::Validation(format!(
                "{language:?} is not a language code"
            )));
        }
        if request.image.is_empty() {
            return Err(SubmitError::Validation("image is empty".to_owned()));
        }
        if request.image.len() > self.config.max_upload_bytes {
            return Err(SubmitError::Validation(format!(
                "image is {} bytes, limit is {}",
                request.image.len(),
                self.config.max_upload_bytes
            )));
        }
        infer::get(&request.image)
            .map(|kind| kind.mime_type())
            .filter(|mime_type| ACCEPTED_MIME_TYPES.contains(mime_type))
            .map(str::to_owned)
            .ok_or_else(|| {
                SubmitError::Validation(format!(
                    "{:?} is not a JPEG, PNG, WebP, TIFF or BMP image",
                    request.filename
                ))
            })
    }
}

/// Why a run stopped early.
enum RunError {
    Cancelled,
    /// The stored record already has a terminal status, usually because a
    /// recovery sweep decided we were dead.
    Superseded,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        RunError::Failed(err)
    }
}

/// One job, running.
struct JobRun {
    inner: Arc<PipelineInner>,
    job: EvaluationJob,
    question: Question,
    image: Vec<u8>,
    mime_type: String,
    options: SubmitOptions,
    progress: ProgressReporter,
    cancel: Arc<AtomicBool>,
    started: Instant,
}

impl JobRun {
    /// Run the job to a terminal status. Never fails: problems are recorded
    /// in the job.
    #[instrument(level = "debug", skip_all, fields(job = %self.job.id))]
    async fn execute(mut self) -> Result<()> {
        let job_id = self.job.id;
        self.progress.stage(Stage::Created);
        let result = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(RunError::Failed(anyhow!("evaluation panicked"))),
        };
        match result {
            Ok(()) => {}
            Err(RunError::Superseded) => {
                warn!(job = %job_id, "Job already finished elsewhere, abandoning run");
            }
            Err(RunError::Cancelled) => {
                self.finish_early(JobStatus::Cancelled, None).await;
            }
            Err(RunError::Failed(err)) => {
                error!(job = %job_id, "Evaluation failed: {:#}", err);
                self.finish_early(JobStatus::Failed, Some(format!("{err:#}")))
                    .await;
            }
        }
        self.inner
            .running
            .lock()
            .expect("lock poisoned")
            .remove(&job_id);
        Ok(())
    }

    /// Run every stage.
    async fn drive(&mut self) -> Result<(), RunError> {
        let inner = self.inner.clone();
        let deps = &inner.deps;

        self.checkpoint(Stage::Uploading).await?;
        let key = format!("{}-original.{}", self.job.id, blob_extension(&self.mime_type));
        let url = deps
            .blobs
            .put(&key, &self.image)
            .await
            .context("Failed to upload image")?;
        self.job.original_image_url = Some(url);

        self.checkpoint(Stage::AssessingImage).await?;
        let quality = deps
            .images
            .assess(&self.image)
            .await
            .context("Failed to assess image quality")?;
        self.job.image_quality = Some(quality);

        let mut ocr_image = OcrImage::new(std::mem::take(&mut self.image), self.mime_type.clone());
        if self.options.enhance_image
            || quality.quality_score < inner.config.enhancement_threshold
        {
            self.checkpoint(Stage::EnhancingImage).await?;
            if let Some(enhanced) = self.enhance(&ocr_image.data).await {
                ocr_image = enhanced;
            }
        }

        self.checkpoint(Stage::ExtractingText).await?;
        let ocr_options = OcrOptions {
            preferred_provider: self.options.preferred_provider.clone(),
            language: self
                .options
                .language
                .clone()
                .unwrap_or_else(|| inner.default_language.clone()),
            priority: self.options.priority.unwrap_or_default(),
        };
        let outcome = deps
            .ocr
            .extract_text(&ocr_image, &ocr_options)
            .await
            .context("Text extraction failed")?;
        drop(ocr_image);
        let recognition = &outcome.recognition;
        self.job.extracted_text = Some(recognition.text.clone());
        self.job.ocr_provider = Some(recognition.provider.clone());
        self.job.ocr_confidence = Some(recognition.confidence);
        self.job.ocr_metadata = Some(outcome.metadata());
        let answer = ExtractedAnswer {
            text: recognition.text.clone(),
            confidence: recognition.confidence,
            met_threshold: outcome.met_threshold,
        };

        // Content and structure are scored concurrently; we checkpoint their
        // results in stage order once both are in.
        self.checkpoint(Stage::AnalyzingContent).await?;
        let (mut content, mut structure) = try_join!(
            deps.content.score_content(&self.question, &answer),
            deps.structure.score_structure(&self.question, &answer),
        )?;
        content.score = clamp_score(content.score);
        structure.score = clamp_score(structure.score);
        self.job.content_score = Some(content.score);
        self.job.content_assessment = Some(content.clone());

        self.checkpoint(Stage::AnalyzingStructure).await?;
        self.job.structure_score = Some(structure.score);
        self.job.structure_assessment = Some(structure.clone());

        self.checkpoint(Stage::AnalyzingHandwriting).await?;
        let handwriting =
            analyze_handwriting(recognition.confidence, &recognition.words, &quality);
        self.job.handwriting_score = Some(handwriting.overall);
        self.job.handwriting_analysis = Some(handwriting);

        self.checkpoint(Stage::GeneratingFeedback).await?;
        let overall = overall_score(content.score, structure.score, handwriting.overall);
        let request = FeedbackRequest {
            question: &self.question,
            answer: &answer,
            content: &content,
            structure: &structure,
            handwriting: &handwriting,
            overall_score: overall,
        };
        let (feedback, source) = feedback_or_fallback(&*deps.feedback, &request).await;
        self.job.strengths = feedback.strengths;
        self.job.improvements = feedback.improvements;
        self.job.suggestions = feedback.suggestions;
        self.job.detailed_feedback = Some(feedback.detailed_feedback);
        self.job.feedback_source = Some(source);

        self.checkpoint(Stage::Persisting).await?;
        let now = Utc::now();
        self.job.overall_score = Some(overall);
        self.job.status = JobStatus::Completed;
        self.job.stage = Stage::Completed;
        self.job.completed_at = Some(now);
        self.job.updated_at = now;
        self.job.processing_duration_ms = Some(self.elapsed_ms());
        if !save_job(&*deps.jobs, &self.job)
            .await
            .context("Failed to save completed job")?
        {
            return Err(RunError::Superseded);
        }
        self.progress.stage(Stage::Completed);
        info!(job = %self.job.id, overall, "Evaluation complete");

        let delay = chrono::Duration::hours(i64::from(inner.config.cleanup_delay_hours));
        if let Err(err) = deps
            .cleanup
            .schedule(self.job.id, self.job.blob_urls(), delay)
            .await
        {
            warn!(job = %self.job.id, "Could not schedule blob cleanup: {:#}", err);
        }
        Ok(())
    }

    /// Enter `stage`: stop if we've been cancelled, then save and report.
    async fn checkpoint(&mut self, stage: Stage) -> Result<(), RunError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(RunError::Cancelled);
        }
        self.job.stage = stage;
        self.job.updated_at = Utc::now();
        if !save_job(&*self.inner.deps.jobs, &self.job)
            .await
            .with_context(|| format!("Failed to checkpoint job at {stage:?}"))?
        {
            return Err(RunError::Superseded);
        }
        self.progress.stage(stage);
        Ok(())
    }

    /// Try to enhance our image. On failure, we carry on with the original.
    async fn enhance(&mut self, original: &[u8]) -> Option<OcrImage> {
        let deps = &self.inner.deps;
        let enhanced = match deps.images.enhance(original).await {
            Ok(enhanced) => enhanced,
            Err(err) => {
                warn!(job = %self.job.id, "Image enhancement failed, using original: {:#}", err);
                return None;
            }
        };
        let key = format!(
            "{}-enhanced.{}",
            self.job.id,
            blob_extension(&enhanced.mime_type)
        );
        match deps.blobs.put(&key, &enhanced.data).await {
            Ok(url) => self.job.enhanced_image_url = Some(url),
            Err(err) => warn!(job = %self.job.id, "Could not upload enhanced image: {:#}", err),
        }
        Some(OcrImage::new(enhanced.data, enhanced.mime_type))
    }

    /// Record a terminal status other than `Completed`, on top of the last
    /// record we managed to save.
    async fn finish_early(&mut self, status: JobStatus, error_message: Option<String>) {
        let jobs = &*self.inner.deps.jobs;
        let job_id = self.job.id;
        let mut record = match jobs.get(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => self.job.clone(),
            Err(err) => {
                warn!(job = %job_id, "Could not reload job, using in-memory copy: {}", err);
                self.job.clone()
            }
        };
        record.status = status;
        record.error_message = error_message;
        record.updated_at = Utc::now();
        record.processing_duration_ms = Some(self.elapsed_ms());
        match save_job(jobs, &record).await {
            Ok(false) => warn!(
                job = %job_id,
                "Job already finished elsewhere, not recording {:?}",
                status
            ),
            Ok(true) => {
                let message = match &record.error_message {
                    Some(err) => format!("Evaluation failed: {err}"),
                    None => "Evaluation cancelled".to_owned(),
                };
                self.progress.report(record.stage, 0, message);
            }
            Err(err) => error!(
                job = %job_id,
                "Could not record {:?} status, leaving job for the next sweep: {}",
                status,
                err
            ),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Ask for feedback, falling back to locally-built feedback if the generator
/// fails or gives us something we can't use.
async fn feedback_or_fallback(
    generator: &dyn FeedbackGenerator,
    request: &FeedbackRequest<'_>,
) -> (Feedback, FeedbackSource) {
    match generator.generate_feedback(request).await {
        Ok(feedback) if feedback.is_usable() => (feedback, FeedbackSource::Generated),
        Ok(_) => {
            warn!("Feedback generator returned unusable feedback, using fallback");
            (fallback_feedback(request), FeedbackSource::Fallback)
        }
        Err(err) => {
            warn!("Feedback generation failed, using fallback: {:#}", err);
            (fallback_feedback(request), FeedbackSource::Fallback)
        }
    }
}

/// Save a job record, retrying transient failures. Returns `false` without
/// saving if the stored record has already reached a terminal status.
pub async fn save_job(jobs: &dyn JobStore, job: &EvaluationJob) -> Result<bool, StoreError> {
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 50..=2_000,
        re_attempts: 4,
        jitter_ratio: 0.2,
    };
    let result = save_attempt(jobs, job)
        .await
        .retry_with_async(|_| async { save_attempt(jobs, job).await })
        .with_exponential_jitter(|| jitter)
        .await;
    resolve("Saving job record", result)
}

/// Make a single attempt at saving a job.
async fn save_attempt(
    jobs: &dyn JobStore,
    job: &EvaluationJob,
) -> RetryResult<(), (), bool, StoreError> {
    let saved = try_potentially_transient!(jobs.save_unless_terminal(job).await);
    retry_result_ok(saved)
}

/// Mark unfinished jobs as failed if they haven't checkpointed since
/// `stale_before`, except those in `skip`. Returns how many jobs we failed.
///
/// Live jobs refresh `updated_at` at every stage, so anything older than the
/// slowest stage has lost its worker.
#[instrument(level = "debug", skip_all, fields(%stale_before))]
pub async fn fail_orphaned_jobs(
    jobs: &dyn JobStore,
    skip: &HashSet<JobId>,
    stale_before: DateTime<Utc>,
) -> Result<usize> {
    let mut count = 0;
    for mut job in jobs.list_unfinished().await? {
        if skip.contains(&job.id) {
            continue;
        }
        if job.updated_at > stale_before {
            debug!(job = %job.id, updated_at = %job.updated_at, "Job is still active");
            continue;
        }
        warn!(job = %job.id, stage = ?job.stage, "Failing orphaned job");
        job.status = JobStatus::Failed;
        job.error_message = Some(ORPHAN_ERROR.to_owned());
        job.updated_at = Utc::now();
        if save_job(jobs, &job).await? {
            count += 1;
        }
    }
    Ok(count)
}

/// A file extension for a blob of type `mime_type`.
fn blob_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/tiff" => "tiff",
        "image/bmp" => "bmp",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::{Notify, Semaphore};

    use crate::{
        imaging::{EnhancedImage, ImageQuality},
        ocr::{
            engines::OcrProvider,
            tests::{Script, ScriptedProvider},
        },
        scoring::{ContentAssessment, StructureAssessment},
        storage::{MemoryJobStore, TaskLedger},
    };

    use super::{progress::ProgressEvent, *};

    /// Just enough of a PNG for format sniffing.
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

    struct FakeImages {
        quality: f64,
        enhance_fails: bool,
        enhance_calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageProcessor for FakeImages {
        async fn assess(&self, _image: &[u8]) -> Result<ImageQuality> {
            Ok(ImageQuality {
                quality_score: self.quality,
                sharpness: self.quality,
                contrast: self.quality,
                exposure: self.quality,
                resolution: 100.0,
                width: 800,
                height: 600,
            })
        }

        async fn enhance(&self, image: &[u8]) -> Result<EnhancedImage> {
            self.enhance_calls.fetch_add(1, Ordering::SeqCst);
            if self.enhance_fails {
                return Err(anyhow!("enhancer broke"));
            }
            Ok(EnhancedImage {
                data: image.to_vec(),
                mime_type: "image/png".to_owned(),
            })
        }
    }

    #[derive(Clone, Copy)]
    enum FeedbackBehavior {
        Good,
        Fail,
        Unusable,
    }

    #[derive(Clone, Copy)]
    enum StructureBehavior {
        Good,
        Fail,
        Panic,
    }

    struct FakeScorer {
        feedback: FeedbackBehavior,
        structure: StructureBehavior,
        content_started: Notify,
        /// If present, content scoring waits for a permit.
        gate: Option<Semaphore>,
    }

    #[async_trait]
    impl ContentScorer for FakeScorer {
        async fn score_content(
            &self,
            _question: &Question,
            _answer: &ExtractedAnswer,
        ) -> Result<ContentAssessment> {
            self.content_started.notify_one();
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await?;
            }
            Ok(ContentAssessment {
                score: 80.0,
                covered_points: vec!["density".to_owned()],
                missing_points: vec![],
                errors: vec![],
                summary: "Mostly right.".to_owned(),
            })
        }
    }

    #[async_trait]
    impl StructureScorer for FakeScorer {
        async fn score_structure(
            &self,
            _question: &Question,
            _answer: &ExtractedAnswer,
        ) -> Result<StructureAssessment> {
            match self.structure {
                StructureBehavior::Good => {}
                StructureBehavior::Fail => return Err(anyhow!("structure model unavailable")),
                StructureBehavior::Panic => panic!("structure scorer blew up"),
            }
            Ok(StructureAssessment {
                score: 60.0,
                organization: "Logical.".to_owned(),
                clarity: "Clear enough.".to_owned(),
                issues: vec![],
            })
        }
    }

    #[async_trait]
    impl FeedbackGenerator for FakeScorer {
        async fn generate_feedback(&self, _request: &FeedbackRequest<'_>) -> Result<Feedback> {
            match self.feedback {
                FeedbackBehavior::Good => Ok(Feedback {
                    strengths: vec!["You explained density.".to_owned()],
                    improvements: vec![],
                    suggestions: vec![],
                    detailed_feedback: "Nice work.".to_owned(),
                }),
                FeedbackBehavior::Fail => Err(anyhow!("feedback model unavailable")),
                FeedbackBehavior::Unusable => Ok(Feedback {
                    strengths: vec![],
                    improvements: vec![],
                    suggestions: vec!["?".to_owned()],
                    detailed_feedback: String::new(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct MemoryBlobs {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        fail_puts: bool,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobs {
        async fn put(&self, key: &str, data: &[u8]) -> Result<String> {
            if self.fail_puts {
                return Err(anyhow!("blob store is read-only"));
            }
            let url = format!("mem://{key}");
            self.blobs
                .lock()
                .unwrap()
                .insert(url.clone(), data.to_vec());
            Ok(url)
        }

        async fn delete(&self, url: &str) -> Result<()> {
            self.blobs.lock().unwrap().remove(url);
            Ok(())
        }
    }

    struct HarnessOptions {
        quality: f64,
        enhance_fails: bool,
        feedback: FeedbackBehavior,
        structure: StructureBehavior,
        upload_fails: bool,
        gated: bool,
        providers: Vec<Arc<dyn OcrProvider>>,
        max_requests: usize,
        max_upload_bytes: usize,
    }

    impl Default for HarnessOptions {
        fn default() -> Self {
            Self {
                quality: 90.0,
                enhance_fails: false,
                feedback: FeedbackBehavior::Good,
                structure: StructureBehavior::Good,
                upload_fails: false,
                gated: false,
                providers: vec![ScriptedProvider::new("good", Script::Succeed(0.9)) as Arc<dyn OcrProvider>],
                max_requests: 100,
                max_upload_bytes: 1024,
            }
        }
    }

    struct Harness {
        pipeline: EvaluationPipeline,
        jobs: Arc<MemoryJobStore>,
        images: Arc<FakeImages>,
        scorer: Arc<FakeScorer>,
        ledger: Arc<TaskLedger>,
        _dir: tempfile::TempDir,
    }

    async fn harness(options: HarnessOptions) -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = Arc::new(
            TaskLedger::open(&dir.path().join("cleanup.json"))
                .await
                .unwrap(),
        );
        let blobs = Arc::new(MemoryBlobs {
            fail_puts: options.upload_fails,
            ..Default::default()
        });
        let jobs = Arc::new(MemoryJobStore::new());
        let images = Arc::new(FakeImages {
            quality: options.quality,
            enhance_fails: options.enhance_fails,
            enhance_calls: AtomicUsize::new(0),
        });
        let scorer = Arc::new(FakeScorer {
            feedback: options.feedback,
            structure: options.structure,
            content_started: Notify::new(),
            gate: options.gated.then(|| Semaphore::new(0)),
        });
        let questions = QuestionBank::from_questions([Question {
            id: "chem-1".to_owned(),
            prompt: "Explain why ice floats.".to_owned(),
            model_answer: None,
            rubric: vec!["density".to_owned()],
            max_marks: 5,
        }])
        .unwrap();

        let mut config = Config::default();
        config.rate_limit.max_requests = options.max_requests;
        config.pipeline.max_upload_bytes = options.max_upload_bytes;
        let ocr = OcrOrchestrator::from_providers(
            options.providers,
            config.ocr.min_confidence,
            config.ocr.attempt_timeout(),
        );
        let deps = PipelineDeps {
            images: images.clone(),
            content: scorer.clone(),
            structure: scorer.clone(),
            feedback: scorer.clone(),
            blobs: blobs.clone(),
            jobs: jobs.clone(),
            questions: Arc::new(questions),
            cleanup: Arc::new(CleanupScheduler::new(ledger.clone(), blobs)),
            ocr,
        };
        Harness {
            pipeline: EvaluationPipeline::new(deps, &config),
            jobs,
            images,
            scorer,
            ledger,
            _dir: dir,
        }
    }

    fn request(subject_id: &str) -> SubmitRequest {
        SubmitRequest {
            subject_id: subject_id.to_owned(),
            question_id: "chem-1".to_owned(),
            filename: "answer.png".to_owned(),
            image: PNG.to_vec(),
            options: SubmitOptions::default(),
        }
    }

    impl Harness {
        /// Submit `request`, wait for it to finish and return the final record.
        async fn evaluate(&self, request: SubmitRequest) -> EvaluationJob {
            let submission = self.pipeline.submit(request, None).await.unwrap();
            submission.worker.join().await.unwrap();
            self.pipeline
                .get_status(submission.job_id)
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_completes_with_bounded_scores() {
        let h = harness(HarnessOptions::default()).await;
        let job = h.evaluate(request("student-1")).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stage, Stage::Completed);
        for score in [
            job.content_score,
            job.structure_score,
            job.handwriting_score,
            job.overall_score,
        ] {
            let score = score.unwrap();
            assert!((0.0..=100.0).contains(&score), "score {score} out of range");
        }
        let expected =
            0.5 * 80.0 + 0.3 * 60.0 + 0.2 * job.handwriting_score.unwrap();
        assert!((job.overall_score.unwrap() - expected).abs() < 1e-9);
        assert_eq!(job.ocr_provider.as_deref(), Some("good"));
        assert_eq!(job.extracted_text.as_deref(), Some("text from good"));
        assert_eq!(job.feedback_source, Some(FeedbackSource::Generated));
        assert_eq!(job.detailed_feedback.as_deref(), Some("Nice work."));
        assert!(job.completed_at.is_some());
        assert!(job.processing_duration_ms.is_some());
        assert!(job.error_message.is_none());
        assert!(job.enhanced_image_url.is_none());
        assert_eq!(h.images.enhance_calls.load(Ordering::SeqCst), 0);

        // Cleanup is scheduled a day out.
        let pending = h.ledger.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, job.id);
        assert_eq!(pending[0].blob_urls, job.blob_urls());
        assert!(pending[0].due_at > Utc::now() + chrono::Duration::hours(23));
    }

    #[tokio::test]
    async fn test_enhancement_branch() {
        // Low quality images are enhanced automatically.
        let h = harness(HarnessOptions {
            quality: 50.0,
            ..Default::default()
        })
        .await;
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.images.enhance_calls.load(Ordering::SeqCst), 1);
        assert!(job.enhanced_image_url.is_some());
        assert_eq!(h.ledger.pending().await.unwrap()[0].blob_urls.len(), 2);

        // Good images are enhanced only on request.
        let h = harness(HarnessOptions::default()).await;
        let mut req = request("student-1");
        req.options.enhance_image = true;
        let job = h.evaluate(req).await;
        assert_eq!(h.images.enhance_calls.load(Ordering::SeqCst), 1);
        assert!(job.enhanced_image_url.is_some());
    }

    #[tokio::test]
    async fn test_enhancement_failure_uses_original() {
        let h = harness(HarnessOptions {
            quality: 50.0,
            enhance_fails: true,
            ..Default::default()
        })
        .await;
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.images.enhance_calls.load(Ordering::SeqCst), 1);
        assert!(job.enhanced_image_url.is_none());
    }

    #[tokio::test]
    async fn test_feedback_fallback() {
        for behavior in [FeedbackBehavior::Fail, FeedbackBehavior::Unusable] {
            let h = harness(HarnessOptions {
                feedback: behavior,
                ..Default::default()
            })
            .await;
            let job = h.evaluate(request("student-1")).await;
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.feedback_source, Some(FeedbackSource::Fallback));
            assert!(!job.strengths.is_empty() || !job.improvements.is_empty());
            assert!(!job.detailed_feedback.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_ocr_exhaustion_fails_job() {
        let h = harness(HarnessOptions {
            providers: vec![
                ScriptedProvider::new("alpha", Script::Fail) as Arc<dyn OcrProvider>,
                ScriptedProvider::new("beta", Script::Fail),
            ],
            ..Default::default()
        })
        .await;
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, Stage::ExtractingText);
        let error = job.error_message.unwrap();
        assert!(error.contains("all OCR providers failed"), "{error}");
        assert!(error.contains("alpha") && error.contains("beta"), "{error}");
        // Earlier results are kept.
        assert!(job.original_image_url.is_some());
        assert!(job.image_quality.is_some());
        assert!(job.overall_score.is_none());
    }

    #[tokio::test]
    async fn test_upload_failure_fails_job() {
        let h = harness(HarnessOptions {
            upload_fails: true,
            ..Default::default()
        })
        .await;
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, Stage::Uploading);
        let error = job.error_message.unwrap();
        assert!(error.contains("Failed to upload image"), "{error}");
        assert!(error.contains("read-only"), "{error}");
        assert_eq!(job.filename, "answer.png");
        assert!(job.original_image_url.is_none());
        assert!(job.image_quality.is_none());
        assert!(h.ledger.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scorer_failure_fails_job() {
        let h = harness(HarnessOptions {
            structure: StructureBehavior::Fail,
            ..Default::default()
        })
        .await;
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, Stage::AnalyzingContent);
        let error = job.error_message.unwrap();
        assert!(error.contains("structure model unavailable"), "{error}");
        // OCR results survive, but neither score is recorded.
        assert_eq!(job.extracted_text.as_deref(), Some("text from good"));
        assert!(job.ocr_confidence.is_some());
        assert!(job.content_score.is_none());
        assert!(job.structure_score.is_none());
        assert!(job.overall_score.is_none());
    }

    #[tokio::test]
    async fn test_panic_fails_job() {
        let h = harness(HarnessOptions {
            structure: StructureBehavior::Panic,
            ..Default::default()
        })
        .await;
        let submission = h.pipeline.submit(request("student-1"), None).await.unwrap();
        // The panic is recorded in the job, not passed on to the worker.
        submission.worker.join().await.unwrap();
        let job = h
            .pipeline
            .get_status(submission.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, Stage::AnalyzingContent);
        assert_eq!(job.error_message.as_deref(), Some("evaluation panicked"));
        assert!(job.extracted_text.is_some());
        assert!(!h.pipeline.cancel(submission.job_id));
    }

    #[tokio::test]
    async fn test_preferred_provider() {
        let h = harness(HarnessOptions {
            providers: vec![
                ScriptedProvider::new("first", Script::Succeed(0.8)) as Arc<dyn OcrProvider>,
                ScriptedProvider::new("second", Script::Succeed(0.95)),
            ],
            ..Default::default()
        })
        .await;
        let mut req = request("student-1");
        req.options.preferred_provider = Some("second".to_owned());
        let job = h.evaluate(req).await;
        assert_eq!(job.ocr_provider.as_deref(), Some("second"));
        assert_eq!(job.ocr_metadata.unwrap()["attempted"], json!(["second"]));
    }

    #[tokio::test]
    async fn test_status_is_stable() {
        let h = harness(HarnessOptions::default()).await;
        let job = h.evaluate(request("student-1")).await;
        let first = serde_json::to_string(&h.pipeline.get_status(job.id).await.unwrap()).unwrap();
        let second =
            serde_json::to_string(&h.pipeline.get_status(job.id).await.unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let h = harness(HarnessOptions::default()).await;
        let events = Arc::new(Mutex::new(Vec::<ProgressEvent>::new()));
        let captured = events.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |event: ProgressEvent| {
            captured.lock().unwrap().push(event);
        });
        let submission = h
            .pipeline
            .submit(request("student-1"), Some(sink))
            .await
            .unwrap();
        submission.worker.join().await.unwrap();

        let events = events.lock().unwrap();
        assert!(events.iter().all(|e| e.job_id == submission.job_id));
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.first().unwrap().percent, 0);
        assert_eq!(events.last().unwrap().percent, 100);
        assert_eq!(events.last().unwrap().stage, Stage::Completed);
        // No enhancement, so we skip that stage.
        assert!(!events.iter().any(|e| e.stage == Stage::EnhancingImage));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let h = harness(HarnessOptions {
            gated: true,
            ..Default::default()
        })
        .await;
        let submission = h.pipeline.submit(request("student-1"), None).await.unwrap();
        h.scorer.content_started.notified().await;
        assert!(h.pipeline.cancel(submission.job_id));
        assert!(!h.pipeline.cancel(JobId::new()));
        h.scorer.gate.as_ref().unwrap().add_permits(1);
        submission.worker.join().await.unwrap();

        let job = h
            .pipeline
            .get_status(submission.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.stage, Stage::AnalyzingContent);
        assert!(job.overall_score.is_none());
        assert!(!h.pipeline.cancel(submission.job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_persistence_failures_are_retried() {
        let h = harness(HarnessOptions::default()).await;
        h.jobs.fail_next_saves(2);
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_checkpoint_failure_fails_job() {
        let h = harness(HarnessOptions::default()).await;
        h.jobs.fail_saves_at(Stage::GeneratingFeedback);
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Failed);
        // We fail on top of the last record we managed to save.
        assert_eq!(job.stage, Stage::AnalyzingHandwriting);
        assert!(job.handwriting_score.is_some());
        assert!(job.overall_score.is_none());
        assert!(job.error_message.unwrap().contains("injected failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_creation_does_not_use_up_rate_limit() {
        let h = harness(HarnessOptions {
            max_requests: 1,
            ..Default::default()
        })
        .await;
        h.jobs.fail_next_saves(usize::MAX);
        match h.pipeline.submit(request("student-1"), None).await {
            Err(SubmitError::Persistence(_)) => {}
            Err(err) => panic!("unexpected error {err}"),
            Ok(_) => panic!("submission accepted without a record"),
        }
        h.jobs.fail_next_saves(0);
        let job = h.evaluate(request("student-1")).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_validation() {
        let h = harness(HarnessOptions::default()).await;
        let cases: [(&str, fn(&mut SubmitRequest)); 7] = [
            ("empty subject", |r| r.subject_id = " ".to_owned()),
            ("empty filename", |r| r.filename = String::new()),
            ("empty image", |r| r.image = vec![]),
            ("oversized image", |r| r.image.resize(2048, 0)),
            ("wrong format", |r| r.image = b"%PDF-1.7 not an image".to_vec()),
            ("unknown question", |r| r.question_id = "missing".to_owned()),
            ("bad language", |r| r.options.language = Some("english please".to_owned())),
        ];

        for (name, mutate) in cases {
            let mut req = request("student-1");
            mutate(&mut req);
            match h.pipeline.submit(req, None).await {
                Err(SubmitError::Validation(_)) => {}
                Err(err) => panic!("{name}: unexpected error {err}"),
                Ok(_) => panic!("{name}: accepted"),
            }
        }
        assert!(h.jobs.list_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let h = harness(HarnessOptions {
            max_requests: 2,
            ..Default::default()
        })
        .await;
        for _ in 0..2 {
            let submission = h.pipeline.submit(request("student-1"), None).await.unwrap();
            submission.worker.join().await.unwrap();
        }
        match h.pipeline.submit(request("student-1"), None).await {
            Err(SubmitError::RateLimited(limited)) => {
                assert_eq!(limited.key, "student-1:evaluations");
            }
            Err(err) => panic!("unexpected error {err}"),
            Ok(_) => panic!("third submission accepted"),
        }
        // Other subjects have their own windows.
        let submission = h.pipeline.submit(request("student-2"), None).await.unwrap();
        submission.worker.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_orphaned_jobs() {
        let h = harness(HarnessOptions::default()).await;
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let mut orphan = EvaluationJob::new("student-1", "chem-1", "answer.png");
        orphan.stage = Stage::ExtractingText;
        orphan.updated_at = long_ago;
        h.jobs.save(&orphan).await.unwrap();
        let mut running = EvaluationJob::new("student-3", "chem-1", "answer.png");
        running.updated_at = long_ago;
        h.jobs.save(&running).await.unwrap();
        let recent = EvaluationJob::new("student-4", "chem-1", "answer.png");
        h.jobs.save(&recent).await.unwrap();
        let done = h.evaluate(request("student-2")).await;

        let skip = HashSet::from([running.id]);
        let stale_before = Utc::now() - chrono::Duration::minutes(30);
        assert_eq!(
            fail_orphaned_jobs(&*h.jobs, &skip, stale_before).await.unwrap(),
            1
        );
        let orphan = h.pipeline.get_status(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.stage, Stage::ExtractingText);
        assert_eq!(orphan.error_message.as_deref(), Some(ORPHAN_ERROR));
        let running = h.pipeline.get_status(running.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Processing);
        let recent = h.pipeline.get_status(recent.id).await.unwrap().unwrap();
        assert_eq!(recent.status, JobStatus::Processing);
        let done = h.pipeline.get_status(done.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            fail_orphaned_jobs(&*h.jobs, &skip, stale_before).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_sweep_leaves_active_jobs_alone() {
        let h = harness(HarnessOptions {
            gated: true,
            ..Default::default()
        })
        .await;
        let submission = h.pipeline.submit(request("student-1"), None).await.unwrap();
        h.scorer.content_started.notified().await;

        // Another process sweeps while we're scoring.
        let stale_before = Utc::now() - chrono::Duration::minutes(30);
        let swept = fail_orphaned_jobs(&*h.jobs, &HashSet::new(), stale_before)
            .await
            .unwrap();
        assert_eq!(swept, 0);

        h.scorer.gate.as_ref().unwrap().add_permits(1);
        submission.worker.join().await.unwrap();
        let job = h
            .pipeline
            .get_status(submission.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_swept_job_stays_failed() {
        let h = harness(HarnessOptions {
            gated: true,
            ..Default::default()
        })
        .await;
        let submission = h.pipeline.submit(request("student-1"), None).await.unwrap();
        h.scorer.content_started.notified().await;

        // A sweep with no grace period fails the job under the worker's feet.
        let swept = fail_orphaned_jobs(&*h.jobs, &HashSet::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(swept, 1);

        h.scorer.gate.as_ref().unwrap().add_permits(1);
        submission.worker.join().await.unwrap();
        let job = h
            .pipeline
            .get_status(submission.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(ORPHAN_ERROR));
        assert_eq!(job.stage, Stage::AnalyzingContent);
        assert!(job.overall_score.is_none());
        assert!(job.completed_at.is_none());
        assert!(h.ledger.pending().await.unwrap().is_empty());
    }
}
