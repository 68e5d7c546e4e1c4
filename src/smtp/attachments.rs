//! Attachment resolution
//!
//! Turns the caller's attachment entries into named byte parts. File-glob
//! entries are listed from disk at call time; inline entries are taken as-is.
//! Entries are resolved strictly in input order so the parts appear in the
//! message in the order they were specified.

use crate::smtp::{until_cancelled, SendEmailError, SendEmailResult};
use async_trait::async_trait;
use glob::Pattern;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Body, SinglePart};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use tokio_util::sync::CancellationToken;

/// One attachment entry: either files matched by a path pattern or content
/// supplied inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachmentSpec {
    FileGlob {
        /// Directory plus file mask, e.g. `/var/out/*.csv`. A trailing
        /// separator or a directory path attaches every file in it.
        pattern: String,
        /// Fail the send when nothing matches
        #[serde(default)]
        throw_if_no_match: bool,
        /// Send without these attachments when nothing matches
        #[serde(default)]
        send_if_no_match: bool,
    },
    InlineContent {
        files: Vec<InlineFile>,
    },
}

impl AttachmentSpec {
    pub fn file_glob(pattern: impl Into<String>) -> Self {
        AttachmentSpec::FileGlob {
            pattern: pattern.into(),
            throw_if_no_match: false,
            send_if_no_match: false,
        }
    }

    pub fn inline(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        AttachmentSpec::InlineContent {
            files: vec![InlineFile::new(file_name, content)],
        }
    }

    /// No effect on inline entries
    pub fn with_throw_if_no_match(mut self, value: bool) -> Self {
        if let AttachmentSpec::FileGlob { throw_if_no_match, .. } = &mut self {
            *throw_if_no_match = value;
        }
        self
    }

    /// No effect on inline entries
    pub fn with_send_if_no_match(mut self, value: bool) -> Self {
        if let AttachmentSpec::FileGlob { send_if_no_match, .. } = &mut self {
            *send_if_no_match = value;
        }
        self
    }
}

/// Attachment created from a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineFile {
    pub file_name: String,
    #[serde(default)]
    pub content: String,
}

impl InlineFile {
    pub fn new(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }
}

/// What to do when a file-glob entry matches nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatchPolicy {
    Fail,
    SkipSend,
    SendWithout,
}

impl NoMatchPolicy {
    /// `throw_if_no_match` wins when both flags are set
    pub fn from_flags(throw_if_no_match: bool, send_if_no_match: bool) -> Self {
        match (throw_if_no_match, send_if_no_match) {
            (true, _) => NoMatchPolicy::Fail,
            (false, true) => NoMatchPolicy::SendWithout,
            (false, false) => NoMatchPolicy::SkipSend,
        }
    }
}

/// A resolved attachment ready to be added to the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl AttachmentPart {
    pub fn new(file_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content,
        }
    }

    /// Guessed from the file extension, `application/octet-stream` otherwise
    pub fn content_type(&self) -> SendEmailResult<ContentType> {
        let mime = mime_guess::from_path(&self.file_name).first_or_octet_stream();
        ContentType::parse(mime.essence_str()).map_err(|e| {
            SendEmailError::InvalidArgument(format!(
                "Invalid content type for '{}': {}",
                self.file_name, e
            ))
        })
    }

    pub fn to_part(self) -> SendEmailResult<SinglePart> {
        let content_type = self.content_type()?;
        Ok(Attachment::new(self.file_name).body(Body::new(self.content), content_type))
    }
}

/// Outcome of resolving all attachment entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Parts to attach, in input order (possibly none)
    Parts(Vec<AttachmentPart>),
    /// A file-glob entry matched nothing and its policy says not to send
    SkipSend { pattern: String },
}

/// Filesystem access used by the resolver
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Files (not directories) directly inside `dir` whose name matches `mask`.
    /// A missing directory has no files.
    async fn list_files(&self, dir: &Path, mask: &Pattern) -> io::Result<Vec<PathBuf>>;

    async fn is_dir(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// [`FileSource`] backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

#[async_trait]
impl FileSource for LocalFiles {
    async fn list_files(&self, dir: &Path, mask: &Pattern) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if mask.matches(&entry.file_name().to_string_lossy()) {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }
}

/// Split a file-glob pattern into its directory and file mask
pub fn split_pattern(pattern: &str) -> (PathBuf, String) {
    if pattern.ends_with('/') || pattern.ends_with(MAIN_SEPARATOR) {
        return (PathBuf::from(pattern), "*".to_string());
    }

    let path = Path::new(pattern);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mask = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "*".to_string());

    (dir, mask)
}

/// Compile a file mask where only `*` and `?` are wildcards. Every other
/// character, brackets included, matches itself.
pub fn file_mask(mask: &str) -> Result<Pattern, glob::PatternError> {
    let mut escaped = String::with_capacity(mask.len());
    let mut previous_star = false;

    for ch in mask.chars() {
        match ch {
            // `**` means recursion to glob; a mask never crosses directories
            '*' if previous_star => continue,
            '*' | '?' => escaped.push(ch),
            _ => escaped.push_str(&Pattern::escape(ch.encode_utf8(&mut [0; 4]))),
        }
        previous_star = ch == '*';
    }

    Pattern::new(&escaped)
}

/// Resolves [`AttachmentSpec`] entries into [`AttachmentPart`]s
pub struct AttachmentResolver<F = LocalFiles> {
    files: F,
}

impl AttachmentResolver<LocalFiles> {
    pub fn new() -> Self {
        Self { files: LocalFiles }
    }
}

impl Default for AttachmentResolver<LocalFiles> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FileSource> AttachmentResolver<F> {
    pub fn with_source(files: F) -> Self {
        Self { files }
    }

    /// Resolve every entry in order. Stops at the first entry whose no-match
    /// policy skips the send, and at the first cancellation check that fires.
    pub async fn resolve(
        &self,
        specs: &[AttachmentSpec],
        cancel: &CancellationToken,
    ) -> SendEmailResult<Resolution> {
        let mut parts = Vec::new();

        for spec in specs {
            if cancel.is_cancelled() {
                return Err(SendEmailError::OperationCancelled);
            }

            match spec {
                AttachmentSpec::FileGlob {
                    pattern,
                    throw_if_no_match,
                    send_if_no_match,
                } => {
                    let matched = self.matching_files(pattern, cancel).await?;

                    if matched.is_empty() {
                        match NoMatchPolicy::from_flags(*throw_if_no_match, *send_if_no_match) {
                            NoMatchPolicy::Fail => {
                                return Err(SendEmailError::AttachmentNotFound {
                                    pattern: pattern.clone(),
                                });
                            }
                            NoMatchPolicy::SkipSend => {
                                tracing::info!("No attachments found matching '{}', skipping send", pattern);
                                return Ok(Resolution::SkipSend {
                                    pattern: pattern.clone(),
                                });
                            }
                            NoMatchPolicy::SendWithout => {
                                tracing::debug!("No attachments found matching '{}', sending anyway", pattern);
                                continue;
                            }
                        }
                    }

                    for path in matched {
                        if cancel.is_cancelled() {
                            return Err(SendEmailError::OperationCancelled);
                        }

                        let content = until_cancelled(cancel, async {
                            self.files.read(&path).await.map_err(|source| SendEmailError::AttachmentRead {
                                path: path.clone(),
                                source,
                            })
                        })
                        .await?;

                        let file_name = path
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_default();
                        tracing::debug!("Attaching {} ({} bytes)", path.display(), content.len());
                        parts.push(AttachmentPart::new(file_name, content));
                    }
                }
                AttachmentSpec::InlineContent { files } => {
                    for file in files {
                        if file.content.is_empty() {
                            continue;
                        }
                        if file.file_name.trim().is_empty() {
                            return Err(SendEmailError::InvalidArgument(
                                "Inline attachment requires a file name".to_string(),
                            ));
                        }
                        parts.push(AttachmentPart::new(
                            file.file_name.clone(),
                            file.content.as_bytes().to_vec(),
                        ));
                    }
                }
            }
        }

        Ok(Resolution::Parts(parts))
    }

    async fn matching_files(
        &self,
        pattern: &str,
        cancel: &CancellationToken,
    ) -> SendEmailResult<Vec<PathBuf>> {
        let (dir, mask) = if self.files.is_dir(Path::new(pattern)).await {
            (PathBuf::from(pattern), "*".to_string())
        } else {
            split_pattern(pattern)
        };

        let mask = file_mask(&mask).map_err(|e| {
            SendEmailError::InvalidArgument(format!("Invalid file mask in '{}': {}", pattern, e))
        })?;

        until_cancelled(cancel, async {
            self.files
                .list_files(&dir, &mask)
                .await
                .map_err(|source| SendEmailError::AttachmentRead { path: dir.clone(), source })
        })
        .await
    }
}
