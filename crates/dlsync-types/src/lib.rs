//! Shared types for dlsync
//!
//! This crate contains the data model shared by the core engine and the CLI:
//! task records, the task state machine, events and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable key of a download task
///
/// Derived from the source locator and the destination directory, so a
/// repeated request for the same pair lands on the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn derive(locator: &str, destination: &Path) -> Self {
        let key = format!("{}\n{}", locator, destination.to_string_lossy());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a unit of work owned by the job scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Error returned when a stored enum value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ============================================================================
// Task Types
// ============================================================================

/// Which transfer engine drives a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Plain resumable HTTP fetch
    Http,
    /// Delegated BitTorrent-style fetch
    Torrent,
}

impl TaskKind {
    /// Guess the kind from the source locator
    pub fn detect(locator: &str) -> Self {
        let lower = locator.to_ascii_lowercase();
        if lower.starts_with("magnet:") || lower.ends_with(".torrent") {
            TaskKind::Torrent
        } else {
            TaskKind::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Http => "http",
            TaskKind::Torrent => "torrent",
        }
    }
}

impl FromStr for TaskKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TaskKind::Http),
            "torrent" => Ok(TaskKind::Torrent),
            other => Err(ParseEnumError {
                kind: "task kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Init,
    Downloading,
    Paused,
    Completed,
    Failed,
    Seeding,
    SeedingPaused,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Init,
        TaskState::Downloading,
        TaskState::Paused,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Seeding,
        TaskState::SeedingPaused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Init => "init",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Seeding => "seeding",
            TaskState::SeedingPaused => "seeding_paused",
        }
    }

    /// States that hold a live job in the scheduler
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Downloading | TaskState::Seeding)
    }

    /// States a task may enter this state from
    pub fn predecessors(&self) -> &'static [TaskState] {
        match self {
            TaskState::Init => &[],
            TaskState::Downloading => &[
                TaskState::Init,
                TaskState::Downloading,
                TaskState::Paused,
                TaskState::Failed,
            ],
            TaskState::Paused => &[TaskState::Downloading],
            TaskState::Completed => &[TaskState::Downloading],
            TaskState::Failed => &[TaskState::Downloading],
            TaskState::Seeding => &[
                TaskState::Completed,
                TaskState::Seeding,
                TaskState::SeedingPaused,
            ],
            TaskState::SeedingPaused => &[TaskState::Seeding],
        }
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        next.predecessors().contains(self)
    }

    /// The state a live task falls back to when its job goes away
    pub fn paused_counterpart(&self) -> Option<TaskState> {
        match self {
            TaskState::Downloading => Some(TaskState::Paused),
            TaskState::Seeding => Some(TaskState::SeedingPaused),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "task state",
                value: s.to_string(),
            })
    }
}

/// One file of a delegated transfer's manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub index: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub downloaded_bytes: u64,
}

/// Durable representation of one download task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub source_locator: String,
    /// Directory the final file is placed in
    pub destination: PathBuf,
    pub display_name: String,
    pub description: Option<String>,
    pub size_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub state: TaskState,
    pub external_job_id: Option<JobId>,
    /// Opaque content-revision marker (ETag or Last-Modified)
    pub validation_tag: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Whether a resumption blob is stored for this task
    #[serde(default)]
    pub has_session: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(locator: impl Into<String>, destination: impl Into<PathBuf>, kind: TaskKind) -> Self {
        let source_locator = locator.into();
        let destination = destination.into();
        let display_name = display_name_for(&source_locator);

        Self {
            id: TaskId::derive(&source_locator, &destination),
            kind,
            source_locator,
            destination,
            display_name,
            description: None,
            size_bytes: None,
            downloaded_bytes: 0,
            state: TaskState::Init,
            external_job_id: None,
            validation_tag: None,
            error: None,
            files: Vec::new(),
            has_session: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fraction downloaded, always within `[0, 1]`
    pub fn progress(&self) -> f64 {
        match self.size_bytes {
            Some(size) if size > 0 => (self.downloaded_bytes as f64 / size as f64).clamp(0.0, 1.0),
            Some(_) if self.state == TaskState::Completed => 1.0,
            _ => 0.0,
        }
    }

    pub fn final_path(&self) -> PathBuf {
        self.destination.join(&self.display_name)
    }

    /// Partial file the HTTP transfer streams into
    pub fn temp_path(&self) -> PathBuf {
        self.destination.join(format!("{}.part", self.display_name))
    }
}

/// Derive a human-readable file name from a locator
///
/// HTTP URLs use their last path segment; magnet links use the `dn`
/// parameter, then the info hash.
pub fn display_name_for(locator: &str) -> String {
    let Ok(parsed) = url::Url::parse(locator) else {
        return "download".to_string();
    };

    if parsed.scheme() == "magnet" {
        let mut hash = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "dn" if !value.is_empty() => return sanitize_file_name(&value),
                "xt" => hash = value.rsplit(':').next().map(sanitize_file_name),
                _ => {}
            }
        }
        return hash.unwrap_or_else(|| "torrent".to_string());
    }

    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let decoded = urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            sanitize_file_name(&decoded)
        })
        .unwrap_or_else(|| "download".to_string())
}

/// Make `name` safe to use as a single path component
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events pushed to the presentation layer
///
/// Delivery is fire-and-forget; subscribers that lag simply miss events and
/// can resynchronise from the snapshot stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TaskAdded {
        task: TaskRecord,
    },
    TaskUpdated {
        task: TaskRecord,
    },
    TaskProgress {
        id: TaskId,
        downloaded: u64,
        total: Option<u64>,
        /// Bytes per second
        speed: u64,
    },
    TaskStateChanged {
        id: TaskId,
        state: TaskState,
        error: Option<String>,
    },
    TaskRemoved {
        id: TaskId,
    },
    Error {
        message: String,
        context: Option<String>,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration, stored as `config.json` in the data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub default_destination: PathBuf,
    pub max_concurrent_jobs: usize,
    pub progress_interval_ms: u64,
    pub progress_window_ms: u64,
    pub description_window_ms: u64,
    pub rename_window_ms: u64,
    pub chunk_size: usize,
    /// Automatic retries of retryable errors within one attempt
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl CoreConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .map(|d| d.join("dlsync"))
                .unwrap_or_else(|| PathBuf::from(".dlsync")),
            default_destination: dirs::download_dir()
                .map(|p| p.join("dlsync"))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_jobs: 4,
            progress_interval_ms: 500,
            progress_window_ms: 1000,
            description_window_ms: 500,
            rename_window_ms: 200,
            chunk_size: 64 * 1024,
            max_retries: 3,
            retry_delay_secs: 5,
            user_agent: format!("dlsync/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
        }
    }
}
