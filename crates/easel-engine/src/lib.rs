use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::events::EventWriter;
use easel_contracts::folders::FolderCache;
use easel_contracts::log::{LogEntry, RunLog, LOG_FILENAME};
use easel_contracts::models::ModelSelector;
use easel_contracts::outcome::{GenerationOutcome, ItemError, ItemFailure, UploadedArtifact};
use easel_contracts::requests::{GenerationRequest, RawRow};
use easel_contracts::session::{new_session_id, SessionContext};
use easel_contracts::summary::{write_summary, RunSummary};
use image::{Rgb, RgbImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub use easel_contracts::session::Credentials;

// ---------------------------------------------------------------------------
// Image providers

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub size: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// One request in, the raw bytes of exactly one artifact out. A failed
/// call fails the item it belongs to; there is no retry.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Registers every provider the supplied credentials can drive. Dryrun
/// is always available so offline runs and tests work without keys.
pub fn default_provider_registry(credentials: &Credentials) -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunImageProvider);
    if let Some(api_key) = credentials.image_api_key.clone() {
        providers.register(OpenAiImageProvider::new(api_key));
    }
    providers
}

pub struct DryrunImageProvider;

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let (width, height) = parse_dims(&request.size);
        let (r, g, b) = color_from_prompt(&request.prompt);
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut buffer = Cursor::new(Vec::new());
        canvas
            .write_to(&mut buffer, image::ImageFormat::Png)
            .context("failed to encode dryrun image")?;
        Ok(GeneratedImage {
            bytes: buffer.into_inner(),
            mime_type: Some("image/png".to_string()),
        })
    }
}

pub struct OpenAiImageProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiImageProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: env::var("EASEL_OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    fn extract_image(&self, response_payload: &Value) -> Result<GeneratedImage> {
        let rows = response_payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for row in rows {
            let Some(obj) = row.as_object() else {
                continue;
            };

            if let Some(b64) = obj.get("b64_json").and_then(Value::as_str) {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("image base64 decode failed")?;
                return Ok(GeneratedImage {
                    bytes,
                    mime_type: None,
                });
            }

            if let Some(url) = obj.get("url").and_then(Value::as_str) {
                return self.download_image(url);
            }
        }

        bail!("provider response returned no images");
    }

    fn download_image(&self, url: &str) -> Result<GeneratedImage> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading provider image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "provider image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading provider image bytes")?
            .to_vec();
        Ok(GeneratedImage { bytes, mime_type })
    }
}

impl ImageProvider for OpenAiImageProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": request.size,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        self.extract_image(&parsed)
    }
}

// ---------------------------------------------------------------------------
// Remote hierarchical storage

pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String>;
    fn upload_file(
        &self,
        name: &str,
        parent_id: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<UploadedArtifact>;
}

const DRIVE_FOLDER_MIME: &str = "application/vnd.google-apps.folder";

pub struct DriveStorage {
    api_base: String,
    upload_base: String,
    token: String,
    http: HttpClient,
}

impl DriveStorage {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: base_from_env(
                "EASEL_DRIVE_API_BASE",
                "https://www.googleapis.com/drive/v3",
            ),
            upload_base: base_from_env(
                "EASEL_DRIVE_UPLOAD_BASE",
                "https://www.googleapis.com/upload/drive/v3",
            ),
            token: token.into(),
            http: HttpClient::new(),
        }
    }

    fn file_id_from(payload: &Value) -> Result<String> {
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("storage response missing file id"))
    }
}

impl StorageProvider for DriveStorage {
    fn name(&self) -> &str {
        "drive"
    }

    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let endpoint = format!("{}/files", self.api_base);
        let mut payload = map_object(json!({
            "name": name,
            "mimeType": DRIVE_FOLDER_MIME,
        }));
        if let Some(parent) = parent_id {
            payload.insert("parents".to_string(), json!([parent]));
        }
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("storage folder create failed ({name})"))?;
        let parsed = response_json_or_error("storage", response)?;
        Self::file_id_from(&parsed)
    }

    fn upload_file(
        &self,
        name: &str,
        parent_id: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<UploadedArtifact> {
        let endpoint = format!("{}/files?uploadType=multipart", self.upload_base);
        let metadata = json!({
            "name": name,
            "parents": [parent_id],
        });
        let metadata_part = MultipartPart::text(metadata.to_string())
            .mime_str("application/json")
            .context("invalid metadata mime")?;
        let file_part = MultipartPart::bytes(bytes)
            .file_name(name.to_string())
            .mime_str(mime_type)
            .with_context(|| format!("invalid mime '{mime_type}' for {name}"))?;
        let form = MultipartForm::new()
            .part("metadata", metadata_part)
            .part("file", file_part);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .with_context(|| format!("storage upload failed ({name})"))?;
        let parsed = response_json_or_error("storage", response)?;
        let file_id = Self::file_id_from(&parsed)?;
        let public_url = public_file_url(&file_id);
        Ok(UploadedArtifact {
            file_id,
            public_url,
        })
    }
}

/// Public reference shape the run log publishes for each uploaded file.
pub fn public_file_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?id={file_id}")
}

/// Directory-backed storage: same contract as the remote service, ids
/// minted locally, `file://` public references. The storage analog of
/// the dryrun image provider.
pub struct LocalDirStorage {
    root: PathBuf,
    folders: Mutex<BTreeMap<String, PathBuf>>,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            folders: Mutex::new(BTreeMap::new()),
        }
    }

    fn parent_path(&self, parent_id: Option<&str>) -> Result<PathBuf> {
        match parent_id {
            None => Ok(self.root.clone()),
            Some(id) => self
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown folder id '{id}'")),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PathBuf>> {
        self.folders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageProvider for LocalDirStorage {
    fn name(&self) -> &str {
        "local"
    }

    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let path = self.parent_path(parent_id)?.join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let folder_id = Uuid::new_v4().to_string();
        self.lock().insert(folder_id.clone(), path);
        Ok(folder_id)
    }

    fn upload_file(
        &self,
        name: &str,
        parent_id: &str,
        bytes: Vec<u8>,
        _mime_type: &str,
    ) -> Result<UploadedArtifact> {
        let path = self.parent_path(Some(parent_id))?.join(name);
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(UploadedArtifact {
            file_id: Uuid::new_v4().to_string(),
            public_url: format!("file://{}", path.display()),
        })
    }
}

// ---------------------------------------------------------------------------
// Notification

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Sends one message per recipient. A failed send fails the whole
/// dispatch; there is no per-recipient partial-success reporting.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()>;
}

pub struct MailGatewayNotifier {
    api_base: String,
    api_key: String,
    sender: String,
    http: HttpClient,
}

impl MailGatewayNotifier {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        let api_base: String = api_base.into();
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            sender: sender.into(),
            http: HttpClient::new(),
        }
    }
}

impl Notifier for MailGatewayNotifier {
    fn name(&self) -> &str {
        "mail-gateway"
    }

    fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let endpoint = format!("{}/messages", self.api_base);
        let mut form = MultipartForm::new()
            .text("from", self.sender.clone())
            .text("to", recipient.to_string())
            .text("subject", subject.to_string())
            .text("text", body.to_string());
        for attachment in attachments {
            let part = MultipartPart::bytes(attachment.bytes.clone())
                .file_name(attachment.name.clone())
                .mime_str(&attachment.mime_type)
                .with_context(|| {
                    format!(
                        "invalid mime '{}' for {}",
                        attachment.mime_type, attachment.name
                    )
                })?;
            form = form.part("attachment", part);
        }
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("mail gateway request failed ({recipient})"))?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "mail gateway send failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Archive

/// Packs the given files into one deflate-compressed zip, each under its
/// base name, input order preserved.
pub fn build_archive(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for path in paths {
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("artifact.png");
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        writer
            .start_file(name, options)
            .with_context(|| format!("failed adding {name} to archive"))?;
        writer
            .write_all(&bytes)
            .with_context(|| format!("failed writing {name} into archive"))?;
    }
    let cursor = writer.finish().context("failed to finalize archive")?;
    Ok(cursor.into_inner())
}

// ---------------------------------------------------------------------------
// Orchestrator

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    RunStarted,
    PerItem(usize),
    Reconciled,
    Terminal,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub project_name: String,
    pub model: Option<String>,
    /// Courtesy pause between items so the provider is not hammered;
    /// `Duration::ZERO` disables it.
    pub pause_between_items: Duration,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attach_log: bool,
    pub preview_email: bool,
    pub send_email: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            project_name: "generated_images".to_string(),
            model: None,
            pause_between_items: Duration::from_secs(2),
            recipients: Vec::new(),
            subject: "Your Generated Images ZIP".to_string(),
            body: "Here is your image zip file and upload log.".to_string(),
            attach_log: true,
            preview_email: false,
            send_email: true,
        }
    }
}

/// Checked at the top of each iteration; a cancelled run stops taking
/// items but still reconciles and archives what it already produced.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Skipped,
    PreviewedOnly,
    Sent { recipients: usize },
    Failed { error: String },
}

impl DeliveryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryStatus::Skipped => "skipped",
            DeliveryStatus::PreviewedOnly => "previewed",
            DeliveryStatus::Sent { .. } => "sent",
            DeliveryStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub session: SessionContext,
    pub outcomes: Vec<GenerationOutcome>,
    pub log: RunLog,
    pub failures: Vec<ItemFailure>,
    pub log_path: PathBuf,
    pub archive_path: PathBuf,
    pub delivery: DeliveryStatus,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

struct ItemSuccess {
    request: GenerationRequest,
    filename: String,
    local_path: PathBuf,
    remote: UploadedArtifact,
    checksum: String,
    folder_created: bool,
}

pub struct BatchEngine {
    out_dir: PathBuf,
    session_id: String,
    events: EventWriter,
    selector: ModelSelector,
    providers: ImageProviderRegistry,
    storage: Box<dyn StorageProvider>,
    notifier: Option<Box<dyn Notifier>>,
    options: BatchOptions,
    cancel: CancelToken,
    state: RunState,
}

impl BatchEngine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        providers: ImageProviderRegistry,
        storage: Box<dyn StorageProvider>,
        notifier: Option<Box<dyn Notifier>>,
        options: BatchOptions,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let session_id = new_session_id();
        let events = EventWriter::new(events_path.into(), session_id.clone());

        events.emit(
            "run_started",
            map_object(json!({
                "out_dir": out_dir.to_string_lossy().to_string(),
                "project": options.project_name,
            })),
        )?;

        Ok(Self {
            out_dir,
            session_id,
            events,
            selector: ModelSelector::new(None),
            providers,
            storage,
            notifier,
            options,
            cancel: CancelToken::new(),
            state: RunState::Idle,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Drives the whole batch: session root, per-item loop, log upload,
    /// archive, optional notification. Per-item failures never abort the
    /// run; only a failed session-root creation is fatal.
    pub fn run(&mut self, rows: &[RawRow]) -> Result<RunOutcome> {
        let started_at = now_utc_iso();
        self.state = RunState::RunStarted;

        let selection = self
            .selector
            .select(self.options.model.as_deref())
            .map_err(anyhow::Error::msg)?;
        if let Some(reason) = &selection.fallback_reason {
            self.events.emit(
                "model_fallback",
                map_object(json!({
                    "model": selection.model.name,
                    "reason": reason,
                })),
            )?;
        }
        let provider = match self.providers.get(&selection.model.provider) {
            Some(provider) => provider,
            None => {
                let available = self.providers.names().join(", ");
                let error = format!(
                    "image provider '{}' not registered (available: [{}])",
                    selection.model.provider, available
                );
                self.events.emit(
                    "run_failed",
                    map_object(json!({"stage": "startup", "error": error})),
                )?;
                bail!("{error}");
            }
        };
        let model_name = selection.model.name.clone();

        let root_folder_id = match self.storage.create_folder(&self.session_id, None) {
            Ok(folder_id) => folder_id,
            Err(err) => {
                self.events.emit(
                    "run_failed",
                    map_object(json!({
                        "stage": "session_init",
                        "error": error_chain_text(&err, 2048),
                    })),
                )?;
                return Err(err).with_context(|| {
                    format!("failed to create session root folder '{}'", self.session_id)
                });
            }
        };
        let session = SessionContext {
            session_id: self.session_id.clone(),
            root_folder_id,
        };
        self.events.emit(
            "session_created",
            map_object(json!({
                "root_folder_id": session.root_folder_id,
            })),
        )?;

        let images_dir = self.out_dir.join("generated_images");
        fs::create_dir_all(&images_dir)
            .with_context(|| format!("failed to create {}", images_dir.display()))?;

        let cache = FolderCache::new();
        let mut log = RunLog::new();
        let mut failures: Vec<ItemFailure> = Vec::new();
        let mut outcomes: Vec<GenerationOutcome> = Vec::new();
        let mut cancelled = false;
        let total = rows.len();

        for (index, row) in rows.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                self.events.emit(
                    "run_cancelled",
                    map_object(json!({"next_index": index})),
                )?;
                break;
            }
            self.state = RunState::PerItem(index);

            match self.process_item(index, row, &session, &cache, provider, &model_name, &images_dir)
            {
                Ok(success) => {
                    if success.folder_created {
                        self.events.emit(
                            "style_folder_created",
                            map_object(json!({"style": success.request.style})),
                        )?;
                    }
                    log.append(LogEntry {
                        prompt: success.request.prompt.clone(),
                        style: success.request.style.clone(),
                        size: success.request.size.clone(),
                        filename: success.filename.clone(),
                        remote_url: success.remote.public_url.clone(),
                    });
                    self.events.emit(
                        "item_completed",
                        map_object(json!({
                            "index": index,
                            "filename": success.filename,
                            "style": success.request.style,
                            "url": success.remote.public_url,
                            "checksum": success.checksum,
                        })),
                    )?;
                    self.events.progress(index + 1, total)?;
                    outcomes.push(GenerationOutcome::Success {
                        local_path: success.local_path,
                        remote: success.remote,
                    });
                    if !self.options.pause_between_items.is_zero() {
                        thread::sleep(self.options.pause_between_items);
                    }
                }
                Err(failure) => {
                    self.events.emit("item_failed", failure.to_payload())?;
                    outcomes.push(GenerationOutcome::Failure(failure.clone()));
                    failures.push(failure);
                }
            }
        }

        // Reconciliation runs no matter how many items failed.
        self.state = RunState::Reconciled;
        let log_path = self.out_dir.join(LOG_FILENAME);
        log.write_csv(&log_path)?;
        match log.to_csv_bytes().and_then(|bytes| {
            self.storage
                .upload_file(LOG_FILENAME, &session.root_folder_id, bytes, "text/csv")
        }) {
            Ok(uploaded) => {
                self.events.emit(
                    "log_uploaded",
                    map_object(json!({
                        "path": log_path.to_string_lossy().to_string(),
                        "url": uploaded.public_url,
                    })),
                )?;
            }
            Err(err) => {
                self.events.emit(
                    "log_upload_failed",
                    map_object(json!({"error": error_chain_text(&err, 2048)})),
                )?;
            }
        }

        self.state = RunState::Terminal;
        let artifact_paths: Vec<PathBuf> = outcomes
            .iter()
            .filter_map(|outcome| outcome.local_path().cloned())
            .collect();
        let archive_bytes = build_archive(&artifact_paths)?;
        let archive_name = format!("{}.zip", self.options.project_name);
        let archive_path = self.out_dir.join(&archive_name);
        fs::write(&archive_path, &archive_bytes)
            .with_context(|| format!("failed writing {}", archive_path.display()))?;
        self.events.emit(
            "archive_built",
            map_object(json!({
                "path": archive_path.to_string_lossy().to_string(),
                "files": artifact_paths.len(),
            })),
        )?;

        let delivery = self.dispatch_notification(&archive_name, &archive_bytes, &log)?;

        let summary = RunSummary {
            session_id: self.session_id.clone(),
            started_at,
            finished_at: now_utc_iso(),
            total_requests: total as u64,
            succeeded: log.len() as u64,
            failed: failures.len() as u64,
            log_path: log_path.to_string_lossy().to_string(),
            archive_path: archive_path.to_string_lossy().to_string(),
        };
        let mut extra = Map::new();
        extra.insert("cancelled".to_string(), Value::Bool(cancelled));
        extra.insert(
            "delivery".to_string(),
            Value::String(delivery.label().to_string()),
        );
        write_summary(&self.out_dir.join("summary.json"), &summary, Some(&extra))?;
        self.events.emit(
            "run_finished",
            map_object(json!({
                "succeeded": log.len(),
                "failed": failures.len(),
                "cancelled": cancelled,
            })),
        )?;

        Ok(RunOutcome {
            session,
            outcomes,
            log,
            failures,
            log_path,
            archive_path,
            delivery,
            cancelled,
        })
    }

    fn process_item(
        &self,
        index: usize,
        row: &RawRow,
        session: &SessionContext,
        cache: &FolderCache,
        provider: &dyn ImageProvider,
        model: &str,
        images_dir: &Path,
    ) -> std::result::Result<ItemSuccess, ItemFailure> {
        let fail = |error: ItemError| ItemFailure {
            index,
            prompt: row.prompt.clone(),
            error,
        };

        let request = GenerationRequest::normalize(row).map_err(&fail)?;

        let generated = provider
            .generate(&GenerateRequest {
                prompt: request.effective_prompt(),
                size: request.size.clone(),
                model: model.to_string(),
            })
            .map_err(|err| fail(ItemError::Generation(error_chain_text(&err, 2048))))?;

        let filename = format!("image_{}.png", index + 1);
        let local_path = images_dir.join(&filename);
        fs::write(&local_path, &generated.bytes).map_err(|err| {
            fail(ItemError::Storage(format!(
                "failed to write {}: {err}",
                local_path.display()
            )))
        })?;
        let checksum = content_hash(&generated.bytes);

        let folder_hit = cache.get(&request.style).is_some();
        let style_folder_id = cache
            .ensure_with(&request.style, || {
                self.storage
                    .create_folder(&request.style, Some(&session.root_folder_id))
            })
            .map_err(|err| fail(ItemError::Storage(error_chain_text(&err, 2048))))?;

        let mime_type = generated.mime_type.as_deref().unwrap_or("image/png");
        let remote = self
            .storage
            .upload_file(&filename, &style_folder_id, generated.bytes, mime_type)
            .map_err(|err| fail(ItemError::Storage(error_chain_text(&err, 2048))))?;

        Ok(ItemSuccess {
            request,
            filename,
            local_path,
            remote,
            checksum,
            folder_created: !folder_hit,
        })
    }

    fn dispatch_notification(
        &self,
        archive_name: &str,
        archive_bytes: &[u8],
        log: &RunLog,
    ) -> Result<DeliveryStatus> {
        let recipients: Vec<&str> = self
            .options
            .recipients
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect();
        if recipients.is_empty() {
            return Ok(DeliveryStatus::Skipped);
        }
        if !self.options.preview_email && !self.options.send_email {
            return Ok(DeliveryStatus::Skipped);
        }

        let mut attachments = vec![Attachment {
            name: archive_name.to_string(),
            mime_type: "application/zip".to_string(),
            bytes: archive_bytes.to_vec(),
        }];
        if self.options.attach_log {
            attachments.push(Attachment {
                name: LOG_FILENAME.to_string(),
                mime_type: "text/csv".to_string(),
                bytes: log.to_csv_bytes()?,
            });
        }
        let attachment_names: Vec<String> = attachments
            .iter()
            .map(|attachment| attachment.name.clone())
            .collect();

        if self.options.preview_email {
            for recipient in &recipients {
                self.events.emit(
                    "notification_preview",
                    map_object(json!({
                        "recipient": recipient,
                        "subject": self.options.subject,
                        "body": self.options.body,
                        "attachments": attachment_names.clone(),
                    })),
                )?;
            }
        }
        if !self.options.send_email {
            return Ok(DeliveryStatus::PreviewedOnly);
        }

        let Some(notifier) = self.notifier.as_deref() else {
            let error = "notification requested but no notifier is configured".to_string();
            self.events.emit(
                "notification_failed",
                map_object(json!({"error": error})),
            )?;
            return Ok(DeliveryStatus::Failed { error });
        };

        for recipient in &recipients {
            if let Err(err) = notifier.send(
                recipient,
                &self.options.subject,
                &self.options.body,
                &attachments,
            ) {
                let error = error_chain_text(&err, 2048);
                self.events.emit(
                    "notification_failed",
                    map_object(json!({"recipient": recipient, "error": error})),
                )?;
                return Ok(DeliveryStatus::Failed { error });
            }
        }
        self.events.emit(
            "notification_sent",
            map_object(json!({"recipients": recipients.len()})),
        )?;
        Ok(DeliveryStatus::Sent {
            recipients: recipients.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.trim().splitn(2, ['x', 'X']);
    let width = parts
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1024);
    let height = parts
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(width);
    (width, height)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

fn base_from_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
