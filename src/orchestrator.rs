//! The upload state machine.
//!
//! ```text
//!   Empty ──select──▶ Selected ──inspect──▶ Inspecting ──▶ Selected
//!     ▲                  │      ──strip────▶ Stripping  ──▶ Selected
//!     └──────reset───────┘ (from any state)
//! ```
//!
//! Besides the main state there is a single error slot that any step may
//! fill and the caller may dismiss at any time.
//!
//! The orchestrator is the only writer of the working session and of the
//! [`SessionStore`]. Its state sits behind a plain mutex that is never held
//! across an await, so `reset` can run while a remote call is still
//! pending. Each accepted file (and each reset) bumps a generation number;
//! a remote result that comes back for an older generation is dropped
//! instead of being written over whatever the user has moved on to.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::{self, FileHandle, SerializedFile};
use crate::config::Config;
use crate::download::{DirectorySink, DownloadSink};
use crate::limiter::{SlidingWindowLimiter, SystemClock};
use crate::picker::FilePicker;
use crate::service::{HttpMetadataService, ImageMetadata, MetadataService, ServiceError};
use crate::store::{FileStore, SessionStore, StoredSession};

/// MIME types accepted at intake.
pub const ALLOWED_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/bmp",
];

/// Largest accepted file, in bytes (10 MiB).
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Prefix for the name of a stripped download.
pub const CLEANED_PREFIX: &str = "cleaned_";

/// The two rate-limited remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Inspect,
    Strip,
}

impl Operation {
    fn label(&self) -> &'static str {
        match self {
            Operation::Inspect => "metadata view",
            Operation::Strip => "strip",
        }
    }
}

/// Main state, derived from the session and the busy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Selected,
    Inspecting,
    Stripping,
}

/// Why a file was refused at intake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please select a valid image file (JPG, PNG, GIF, BMP)")]
    UnsupportedType(String),
    #[error("File size must be less than 10MB")]
    TooLarge(u64),
}

/// Everything an orchestrator step can fail with.
///
/// `Validation`, `RateLimited`, `Remote` and `Download` are shown to the
/// user and occupy the error slot. The rest only tell the caller why
/// nothing happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Denied locally (`retry_after` known) or by the service (unknown).
    #[error("{}", rate_limit_message(.operation, .retry_after))]
    RateLimited {
        operation: Operation,
        retry_after: Option<u64>,
    },
    #[error("{0}")]
    Remote(String),
    #[error("Failed to save download: {0}")]
    Download(String),
    #[error("No file selected")]
    NoFile,
    #[error("A {} request is already in progress", .0.label())]
    Busy(Operation),
    #[error("The selected file changed before the request finished")]
    Superseded,
}

impl UploadError {
    /// Whether this error belongs in the user-visible error slot.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            UploadError::Validation(_)
                | UploadError::RateLimited { .. }
                | UploadError::Remote(_)
                | UploadError::Download(_)
        )
    }
}

fn rate_limit_message(operation: &Operation, retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(
            "Too many {} requests. Please wait {secs} seconds before trying again.",
            operation.label()
        ),
        None => "Rate limit exceeded. Please wait a moment before trying again.".to_string(),
    }
}

/// Check a file against the intake whitelist and size ceiling.
pub fn validate(file: &FileHandle) -> Result<(), ValidationError> {
    if !ALLOWED_TYPES.contains(&file.mime_type.as_str()) {
        return Err(ValidationError::UnsupportedType(file.mime_type.clone()));
    }
    if file.size() > MAX_FILE_SIZE {
        return Err(ValidationError::TooLarge(file.size()));
    }
    Ok(())
}

/// Name of the stripped copy of `name`.
pub fn cleaned_file_name(name: &str) -> String {
    format!("{CLEANED_PREFIX}{name}")
}

/// Collaborators handed to an [`UploadOrchestrator`].
pub struct OrchestratorContext {
    pub service: Arc<dyn MetadataService>,
    pub store: Arc<dyn SessionStore>,
    pub sink: Arc<dyn DownloadSink>,
    pub inspect_limiter: SlidingWindowLimiter,
    pub strip_limiter: SlidingWindowLimiter,
}

impl OrchestratorContext {
    /// HTTP service, file-backed session, directory downloads, wall-clock
    /// limiters.
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock = Arc::new(SystemClock);
        Ok(Self {
            service: Arc::new(HttpMetadataService::from_config(&config.service)?),
            store: Arc::new(FileStore::new(config.session_path()?)),
            sink: Arc::new(DirectorySink::new(&config.storage.download_dir)),
            inspect_limiter: SlidingWindowLimiter::from_config(&config.limits.inspect, clock.clone()),
            strip_limiter: SlidingWindowLimiter::from_config(&config.limits.strip, clock),
        })
    }
}

/// Summary of the selected file for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub last_modified: i64,
}

/// Point-in-time view of the orchestrator for the presentation layer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phase: Phase,
    pub file: Option<FileSummary>,
    pub metadata: Option<ImageMetadata>,
    pub error: Option<UploadError>,
    pub inspecting: bool,
    pub stripping: bool,
}

/// Remaining admissions for one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub remaining: u32,
    pub retry_after: u64,
}

struct ActiveSession {
    file: Arc<FileHandle>,
    encoded: Arc<SerializedFile>,
    metadata: Option<ImageMetadata>,
}

struct State {
    generation: u64,
    session: Option<ActiveSession>,
    error: Option<UploadError>,
    inspecting: bool,
    stripping: bool,
    inspect_limiter: SlidingWindowLimiter,
    strip_limiter: SlidingWindowLimiter,
}

impl State {
    fn busy(&self, op: Operation) -> bool {
        match op {
            Operation::Inspect => self.inspecting,
            Operation::Strip => self.stripping,
        }
    }

    fn set_busy(&mut self, op: Operation, busy: bool) {
        match op {
            Operation::Inspect => self.inspecting = busy,
            Operation::Strip => self.stripping = busy,
        }
    }

    fn limiter(&self, op: Operation) -> &SlidingWindowLimiter {
        match op {
            Operation::Inspect => &self.inspect_limiter,
            Operation::Strip => &self.strip_limiter,
        }
    }

    fn limiter_mut(&mut self, op: Operation) -> &mut SlidingWindowLimiter {
        match op {
            Operation::Inspect => &mut self.inspect_limiter,
            Operation::Strip => &mut self.strip_limiter,
        }
    }

    /// Start a new generation with `session` (or none) and a clean slate.
    fn replace_session(&mut self, session: Option<ActiveSession>) -> u64 {
        self.generation += 1;
        self.session = session;
        self.error = None;
        self.inspecting = false;
        self.stripping = false;
        self.generation
    }

    fn phase(&self) -> Phase {
        match (&self.session, self.inspecting, self.stripping) {
            (None, _, _) => Phase::Empty,
            (Some(_), true, _) => Phase::Inspecting,
            (Some(_), false, true) => Phase::Stripping,
            (Some(_), false, false) => Phase::Selected,
        }
    }
}

/// Sequences intake, remote calls and persistence for the current file.
///
/// # Example
///
/// ```rust,no_run
/// use meta_strip::codec::FileHandle;
/// use meta_strip::config::Config;
/// use meta_strip::orchestrator::{OrchestratorContext, UploadOrchestrator};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::load(None)?;
/// let orchestrator = UploadOrchestrator::start(OrchestratorContext::from_config(&config)?).await;
///
/// let file = FileHandle::new("photo.jpg", "image/jpeg", std::fs::read("photo.jpg")?, 0);
/// orchestrator.select_file(file).await?;
///
/// let metadata = orchestrator.inspect().await?;
/// println!("Has metadata: {}", metadata.has_metadata);
///
/// let saved = orchestrator.strip().await?;
/// println!("Clean copy: {}", saved.display());
/// # Ok(())
/// # }
/// ```
pub struct UploadOrchestrator {
    service: Arc<dyn MetadataService>,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn DownloadSink>,
    state: Mutex<State>,
    /// Serializes store writes so a superseded save can't land after a newer one.
    persist_lock: tokio::sync::Mutex<()>,
}

impl UploadOrchestrator {
    /// An orchestrator in `Empty` that has not looked at the store.
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            service: ctx.service,
            store: ctx.store,
            sink: ctx.sink,
            state: Mutex::new(State {
                generation: 0,
                session: None,
                error: None,
                inspecting: false,
                stripping: false,
                inspect_limiter: ctx.inspect_limiter,
                strip_limiter: ctx.strip_limiter,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Build an orchestrator and restore any saved session.
    pub async fn start(ctx: OrchestratorContext) -> Self {
        let orchestrator = Self::new(ctx);
        orchestrator.restore().await;
        orchestrator
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the saved session, if any, and enter `Selected` with it.
    ///
    /// Only applies while the machine is still `Empty`. A record that can't
    /// be decoded is removed. Returns whether a session was restored.
    pub async fn restore(&self) -> bool {
        let generation = self.lock().generation;

        let record = match self.store.load().await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("Failed to load saved session: {e:#}");
                return false;
            }
        };

        let Some(file) = codec::decode(&record.file_data) else {
            log::warn!("Saved session is unusable; discarding it");
            self.clear_store_if_current(generation).await;
            return false;
        };
        if let Err(e) = validate(&file) {
            log::warn!("Saved session {} is not acceptable ({e}); discarding it", file.name);
            self.clear_store_if_current(generation).await;
            return false;
        }

        let mut state = self.lock();
        if state.session.is_some() || state.generation != generation {
            log::debug!("Session already selected; not restoring the saved one");
            return false;
        }

        log::info!(
            "Restored {} ({} bytes){}",
            file.name,
            file.size(),
            if record.metadata.is_some() { " with metadata" } else { "" }
        );
        state.replace_session(Some(ActiveSession {
            file: Arc::new(file),
            encoded: Arc::new(record.file_data),
            metadata: record.metadata,
        }));
        true
    }

    /// Take a new file. Invalid files leave the state as it was.
    pub async fn select_file(&self, file: FileHandle) -> Result<(), UploadError> {
        if let Err(e) = validate(&file) {
            log::warn!("Rejected {}: {e}", file.name);
            let err = UploadError::from(e);
            self.lock().error = Some(err.clone());
            return Err(err);
        }

        let encoded = Arc::new(codec::encode(&file));
        log::info!("Selected {} ({} bytes, {})", file.name, file.size(), file.mime_type);

        let generation = self.lock().replace_session(Some(ActiveSession {
            file: Arc::new(file),
            encoded: encoded.clone(),
            metadata: None,
        }));

        self.persist(
            generation,
            StoredSession {
                file_data: (*encoded).clone(),
                metadata: None,
            },
        )
        .await;
        Ok(())
    }

    /// Take a file from a picker. `Ok(false)` if the user cancelled.
    pub async fn select_from(&self, picker: &dyn FilePicker) -> Result<bool, UploadError> {
        match picker.pick().await {
            Ok(Some(file)) => self.select_file(file).await.map(|()| true),
            Ok(None) => {
                log::debug!("{} picker cancelled", picker.name());
                Ok(false)
            }
            Err(e) => {
                log::warn!("{} picker failed: {e:#}", picker.name());
                let err = UploadError::Remote(format!("{e:#}"));
                self.lock().error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Ask the service for the current file's metadata and remember it.
    pub async fn inspect(&self) -> Result<ImageMetadata, UploadError> {
        let (generation, file) = self.begin(Operation::Inspect)?;
        let outcome = self.service.inspect(&file).await;

        let (metadata, record) = {
            let mut state = self.lock();
            if state.generation != generation {
                log::debug!("Dropping inspect result for {}: session changed", file.name);
                return Err(UploadError::Superseded);
            }
            state.inspecting = false;

            let metadata = match outcome {
                Ok(metadata) => metadata,
                Err(e) => return Err(Self::fail(&mut state, Operation::Inspect, e)),
            };
            let Some(session) = state.session.as_mut() else {
                return Err(UploadError::Superseded);
            };
            session.metadata = Some(metadata.clone());
            let record = StoredSession {
                file_data: (*session.encoded).clone(),
                metadata: Some(metadata.clone()),
            };
            (metadata, record)
        };

        log::info!(
            "Inspected {}: {} field(s)",
            file.name,
            metadata.exif_data.len()
        );
        self.persist(generation, record).await;
        Ok(metadata)
    }

    /// Have the service strip the current file and save the clean copy as
    /// `cleaned_<name>`.
    pub async fn strip(&self) -> Result<PathBuf, UploadError> {
        let (generation, file) = self.begin(Operation::Strip)?;
        let outcome = self.service.strip(&file).await;

        let bytes = {
            let mut state = self.lock();
            if state.generation != generation {
                log::debug!("Dropping strip result for {}: session changed", file.name);
                return Err(UploadError::Superseded);
            }
            match outcome {
                Ok(bytes) => bytes,
                Err(e) => {
                    state.stripping = false;
                    return Err(Self::fail(&mut state, Operation::Strip, e));
                }
            }
        };

        let saved = self.sink.save_as(&cleaned_file_name(&file.name), &bytes).await;

        let mut state = self.lock();
        if state.generation != generation {
            log::debug!("Session changed while saving the stripped copy of {}", file.name);
            return Err(UploadError::Superseded);
        }
        state.stripping = false;
        match saved {
            Ok(path) => {
                log::info!("Stripped {} -> {}", file.name, path.display());
                Ok(path)
            }
            Err(e) => {
                log::error!("Failed to save stripped copy of {}: {e:#}", file.name);
                let err = UploadError::Download(format!("{e:#}"));
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Forget the current file everywhere and return to `Empty`.
    ///
    /// Pending remote calls are not cancelled; their results are dropped
    /// when they arrive.
    pub async fn reset(&self) {
        let generation = self.lock().replace_session(None);
        log::debug!("Reset to generation {generation}");
        self.clear_store_if_current(generation).await;
    }

    /// Liveness of the remote service. Not used by any guard.
    pub async fn health(&self) -> Result<String, ServiceError> {
        self.service.health().await
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase()
    }

    /// The error currently shown, if any.
    pub fn error(&self) -> Option<UploadError> {
        self.lock().error.clone()
    }

    pub fn dismiss_error(&self) {
        self.lock().error = None;
    }

    pub fn current_file(&self) -> Option<Arc<FileHandle>> {
        self.lock().session.as_ref().map(|s| s.file.clone())
    }

    pub fn metadata(&self) -> Option<ImageMetadata> {
        self.lock().session.as_ref().and_then(|s| s.metadata.clone())
    }

    /// Data URL of the current file for previewing.
    pub fn preview_url(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.encoded.data_url.clone())
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            phase: state.phase(),
            file: state.session.as_ref().map(|s| FileSummary {
                name: s.file.name.clone(),
                mime_type: s.file.mime_type.clone(),
                size: s.file.size(),
                last_modified: s.file.last_modified,
            }),
            metadata: state.session.as_ref().and_then(|s| s.metadata.clone()),
            error: state.error.clone(),
            inspecting: state.inspecting,
            stripping: state.stripping,
        }
    }

    pub fn rate_status(&self, op: Operation) -> RateStatus {
        let state = self.lock();
        let limiter = state.limiter(op);
        RateStatus {
            remaining: limiter.remaining(),
            retry_after: limiter.retry_after_seconds(),
        }
    }

    /// Administrative: empty both rate windows.
    pub fn reset_limits(&self) {
        let mut state = self.lock();
        state.inspect_limiter.reset();
        state.strip_limiter.reset();
    }

    /// Guard a remote call: needs a file, no call of the same kind in flight,
    /// and admission from that kind's limiter. On success marks the
    /// operation busy and returns the generation and file to work on.
    fn begin(&self, op: Operation) -> Result<(u64, Arc<FileHandle>), UploadError> {
        let mut state = self.lock();

        let Some(file) = state.session.as_ref().map(|s| s.file.clone()) else {
            return Err(UploadError::NoFile);
        };
        if state.busy(op) {
            return Err(UploadError::Busy(op));
        }

        let limiter = state.limiter_mut(op);
        if !limiter.admit() {
            let retry_after = limiter.retry_after_seconds();
            log::warn!("{} denied locally; retry in {retry_after}s", op.label());
            let err = UploadError::RateLimited {
                operation: op,
                retry_after: Some(retry_after),
            };
            state.error = Some(err.clone());
            return Err(err);
        }

        state.set_busy(op, true);
        state.error = None;
        log::debug!("{} admitted for {}", op.label(), file.name);
        Ok((state.generation, file))
    }

    /// Record a remote failure in the error slot.
    fn fail(state: &mut State, op: Operation, err: ServiceError) -> UploadError {
        let err = match err {
            ServiceError::RateLimited => UploadError::RateLimited {
                operation: op,
                retry_after: None,
            },
            ServiceError::Failed(message) => UploadError::Remote(message),
        };
        log::warn!("{} failed: {err}", op.label());
        state.error = Some(err.clone());
        err
    }

    /// Write `record` unless the session has moved on. Failures are logged
    /// and otherwise ignored.
    async fn persist(&self, generation: u64, record: StoredSession) {
        let _guard = self.persist_lock.lock().await;
        let current = self.lock().generation == generation;
        if !current {
            log::debug!("Skipping save of superseded session {}", record.file_data.name);
            return;
        }
        if let Err(e) = self.store.save(&record).await {
            log::warn!("Failed to save session: {e:#}");
        }
    }

    async fn clear_store_if_current(&self, generation: u64) {
        let _guard = self.persist_lock.lock().await;
        let current = self.lock().generation == generation;
        if !current {
            return;
        }
        if let Err(e) = self.store.clear().await {
            log::warn!("Failed to clear saved session: {e:#}");
        }
    }
}
