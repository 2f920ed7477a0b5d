//! HuggingFace model downloader
//!
//! Enumerates the files of a hub repository and fetches them one by one into
//! a local model directory.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::CONTENT_LENGTH;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::storage::StorageError;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Size assumed when the weights' size cannot be determined
pub const FALLBACK_MODEL_SIZE: u64 = 4_000_000_000;

const USER_AGENT: &str = concat!("quant-binding/", env!("CARGO_PKG_VERSION"));

/// Repository files that are never downloaded
const SKIPPED_FILES: &[&str] = &[".gitattributes"];

const WEIGHT_EXTENSIONS: &[&str] = &[".safetensors", ".gguf", ".bin"];

/// Download errors
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not list repository files: {0}")]
    Listing(String),
    #[error("No files found in repository {0}")]
    NoFiles(String),
    #[error("Download incomplete for {file}: got {got} bytes, expected {expected}")]
    Incomplete { file: String, got: u64, expected: u64 },
    #[error("Checksum mismatch for {file} (got {got}, want {want})")]
    Checksum { file: String, got: String, want: String },
    #[error(transparent)]
    Settings(#[from] StorageError),
}

/// A hub repository at a given revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRepo {
    pub repo_id: String,
    pub revision: String,
    /// Single file to fetch instead of the whole repository
    pub file: Option<String>,
    /// `scheme://host` the URL named, if any
    pub endpoint: Option<String>,
}

impl HubRepo {
    /// Parse various repository URL formats:
    ///
    /// 1. https://huggingface.co/owner/repo
    /// 2. https://huggingface.co/owner/repo/tree/dev
    /// 3. https://huggingface.co/owner/repo/resolve/main/model.gguf
    /// 4. owner/repo
    pub fn parse(url: &str) -> Result<Self, DownloadError> {
        let url = url.trim();
        let url = url.split('?').next().unwrap_or(url);
        let url = url.split('#').next().unwrap_or(url);

        let (endpoint, path) = match url.split_once("://") {
            Some((scheme, rest)) => {
                let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
                if host.is_empty() {
                    return Err(DownloadError::InvalidUrl(url.to_string()));
                }
                (Some(format!("{}://{}", scheme, host)), path)
            }
            None => (None, url),
        };

        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }

        let (revision, file) = if parts.len() > 3 && matches!(parts[2], "tree" | "blob" | "resolve") {
            let file = (parts[2] != "tree" && parts.len() > 4).then(|| parts[4..].join("/"));
            (parts[3], file)
        } else {
            ("main", None)
        };

        Ok(Self {
            repo_id: format!("{}/{}", parts[0], parts[1]),
            revision: revision.to_string(),
            file,
            endpoint,
        })
    }

    /// Restrict the repository to a single file
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Repository name without its owner
    pub fn name(&self) -> &str {
        self.repo_id
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.repo_id)
    }
}

/// A way to enumerate the files of a repository
#[async_trait]
pub trait FileListing: Send + Sync {
    fn name(&self) -> &str;

    async fn list_files(
        &self,
        http: &reqwest::Client,
        endpoint: &str,
        repo: &HubRepo,
    ) -> Result<Vec<String>, DownloadError>;
}

/// Listing through the hub's JSON tree API
pub struct ApiListing;

#[derive(Debug, serde::Deserialize)]
struct TreeEntry {
    #[serde(rename = "type", default)]
    kind: String,
    path: String,
}

#[async_trait]
impl FileListing for ApiListing {
    fn name(&self) -> &str {
        "api"
    }

    async fn list_files(
        &self,
        http: &reqwest::Client,
        endpoint: &str,
        repo: &HubRepo,
    ) -> Result<Vec<String>, DownloadError> {
        let url = format!(
            "{}/api/models/{}/tree/{}",
            endpoint, repo.repo_id, repo.revision
        );
        let response = http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url,
                status: response.status(),
            });
        }

        let entries: Vec<TreeEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind.is_empty() || e.kind == "file")
            .map(|e| e.path)
            .collect())
    }
}

/// Listing scraped from the repository's HTML tree page.
///
/// Depends on the page markup; only used when the API is unavailable.
pub struct TreePageListing;

#[async_trait]
impl FileListing for TreePageListing {
    fn name(&self) -> &str {
        "tree page"
    }

    async fn list_files(
        &self,
        http: &reqwest::Client,
        endpoint: &str,
        repo: &HubRepo,
    ) -> Result<Vec<String>, DownloadError> {
        let url = format!("{}/{}/tree/{}", endpoint, repo.repo_id, repo.revision);
        let response = http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url,
                status: response.status(),
            });
        }

        let files = parse_tree_page(&response.text().await?);
        if files.is_empty() {
            return Err(DownloadError::Listing(format!("no file entries on {}", url)));
        }
        Ok(files)
    }
}

static ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<a\s[^>]*?class="([^"]*)"[^>]*>(.*?)</a>"#).expect("valid anchor regex")
});

static SPAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<span[^>]*?class="([^"]*)"[^>]*>([^<]*)</span>"#).expect("valid span regex")
});

/// File names of a tree page: the `truncate` span inside each `group` anchor
pub fn parse_tree_page(html: &str) -> Vec<String> {
    let mut files = Vec::new();
    for anchor in ANCHOR_RE.captures_iter(html) {
        if !anchor[1].split_whitespace().any(|c| c == "group") {
            continue;
        }
        let name = SPAN_RE
            .captures_iter(&anchor[2])
            .find(|span| span[1].split_whitespace().any(|c| c == "truncate"))
            .map(|span| decode_entities(span[2].trim()));
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            files.push(name);
        }
    }
    files
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn sanitize_local_filename(filename: &str) -> Result<String, DownloadError> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::InvalidFileName(filename.to_string()));
    }

    let no_leading = trimmed.trim_start_matches('/');
    let flattened = no_leading.replace('\\', "/").replace('/', "__");

    let mut sanitized = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        let invalid = matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*');
        if invalid || ch.is_control() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(DownloadError::InvalidFileName(filename.to_string()));
    }

    Ok(sanitized)
}

pub fn is_weight_file(name: &str) -> bool {
    WEIGHT_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Lowercase hex SHA-256 of the file at `path`
pub fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check a finished body against its announced length and expected digest
fn verify_download(
    file_name: &str,
    downloaded: u64,
    total: Option<u64>,
    digest: &str,
    expected_sha256: Option<&str>,
) -> Result<(), DownloadError> {
    if let Some(expected) = total {
        if downloaded != expected {
            return Err(DownloadError::Incomplete {
                file: file_name.to_string(),
                got: downloaded,
                expected,
            });
        }
    }

    if let Some(want) = expected_sha256 {
        let want = want.trim().to_lowercase();
        if digest != want {
            return Err(DownloadError::Checksum {
                file: file_name.to_string(),
                got: digest.to_string(),
                want,
            });
        }
    }
    Ok(())
}

/// Stream the response body into `path`, hashing it on the way
async fn write_body(
    response: &mut reqwest::Response,
    path: &Path,
    total: Option<u64>,
    progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
) -> Result<(u64, String), DownloadError> {
    let mut file = File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        if let Some(report) = progress {
            report(downloaded, total.unwrap_or(0));
        }
    }
    file.flush().await?;

    Ok((downloaded, hex::encode(hasher.finalize())))
}

/// Client for a hub endpoint
#[derive(Clone)]
pub struct HubClient {
    http: reqwest::Client,
    endpoint: String,
    listings: Vec<Arc<dyn FileListing>>,
}

impl HubClient {
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, DownloadError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3600)) // 1 hour timeout for large models
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_client(endpoint, http))
    }

    pub fn with_client(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            listings: vec![Arc::new(ApiListing), Arc::new(TreePageListing)],
        }
    }

    /// Replace the listing strategies, tried in order
    pub fn with_listings(mut self, listings: Vec<Arc<dyn FileListing>>) -> Self {
        self.listings = listings;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Host serving `repo`: the one its URL named, else the client default
    fn endpoint_for<'a>(&'a self, repo: &'a HubRepo) -> &'a str {
        repo.endpoint.as_deref().unwrap_or(&self.endpoint)
    }

    pub fn file_url(&self, repo: &HubRepo, file_name: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint_for(repo),
            repo.repo_id,
            repo.revision,
            file_name
        )
    }

    /// Names of the files to download from `repo`
    pub async fn get_filenames(&self, repo: &HubRepo) -> Result<Vec<String>, DownloadError> {
        let endpoint = self.endpoint_for(repo);
        let mut last_error = None;

        for listing in &self.listings {
            match listing.list_files(&self.http, endpoint, repo).await {
                Ok(files) => {
                    let files: Vec<String> = files
                        .into_iter()
                        .filter(|f| !SKIPPED_FILES.contains(&f.as_str()))
                        .collect();
                    tracing::info!(
                        "Repo {}: found {} files via {} listing",
                        repo.repo_id,
                        files.len(),
                        listing.name()
                    );
                    for file in &files {
                        tracing::debug!("  {}", file);
                    }
                    return Ok(files);
                }
                Err(e) => {
                    tracing::warn!(
                        "{} listing failed for {}: {}",
                        listing.name(),
                        repo.repo_id,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DownloadError::NoFiles(repo.repo_id.clone())))
    }

    /// Download the files of `repo` into `dest_dir`, one after another.
    ///
    /// When `repo` names a single file only that file is fetched, otherwise
    /// the whole repository is. `progress` receives `(downloaded, total)`
    /// bytes for weight files. The first failing file aborts the rest.
    pub async fn download_model(
        &self,
        repo: &HubRepo,
        dest_dir: &Path,
        progress: impl Fn(u64, u64) + Send + Sync,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let file_names = match &repo.file {
            Some(file) => vec![file.clone()],
            None => self.get_filenames(repo).await?,
        };
        if file_names.is_empty() {
            return Err(DownloadError::NoFiles(repo.repo_id.clone()));
        }

        fs::create_dir_all(dest_dir)?;

        let mut downloaded = Vec::with_capacity(file_names.len());
        for file_name in &file_names {
            let report: Option<&(dyn Fn(u64, u64) + Send + Sync)> = if is_weight_file(file_name) {
                Some(&progress)
            } else {
                None
            };
            let path = self
                .download_file(repo, file_name, dest_dir, None, report)
                .await?;
            downloaded.push(path);
        }

        tracing::info!(
            "Downloaded {} files of {} into {:?}",
            downloaded.len(),
            repo.repo_id,
            dest_dir
        );
        Ok(downloaded)
    }

    /// Download the single file `repo` names and check its SHA-256
    pub async fn download_verified(
        &self,
        repo: &HubRepo,
        dest_dir: &Path,
        sha256: &str,
        progress: impl Fn(u64, u64) + Send + Sync,
    ) -> Result<PathBuf, DownloadError> {
        let file_name = repo
            .file
            .as_deref()
            .ok_or_else(|| DownloadError::InvalidUrl(format!("{} names no file", repo.repo_id)))?;

        fs::create_dir_all(dest_dir)?;
        self.download_file(repo, file_name, dest_dir, Some(sha256), Some(&progress))
            .await
    }

    async fn download_file(
        &self,
        repo: &HubRepo,
        file_name: &str,
        dest_dir: &Path,
        expected_sha256: Option<&str>,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> Result<PathBuf, DownloadError> {
        let safe_name = sanitize_local_filename(file_name)?;
        let output_path = dest_dir.join(&safe_name);
        let temp_path = dest_dir.join(format!("{}.tmp", safe_name));

        // Check if file already exists and has content
        if let Ok(metadata) = fs::metadata(&output_path) {
            if metadata.len() > 0 {
                match expected_sha256 {
                    Some(want) if sha256_file(&output_path)? != want.trim().to_lowercase() => {
                        tracing::warn!("Checksum mismatch for {:?}, downloading again", output_path);
                    }
                    _ => {
                        tracing::info!("Already present, skipping: {:?}", output_path);
                        return Ok(output_path);
                    }
                }
            }
        }

        let url = self.file_url(repo, file_name);
        tracing::info!("Downloading {}", url);

        let mut response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url,
                status: response.status(),
            });
        }

        let total = response.content_length();
        if let Some(total) = total {
            tracing::debug!("{}: {}", file_name, format_size(total));
        }

        // Write to temp file first; anything short of a verified body is discarded
        let result = write_body(&mut response, &temp_path, total, progress)
            .await
            .and_then(|(downloaded, digest)| {
                verify_download(file_name, downloaded, total, &digest, expected_sha256)
            });
        if let Err(e) = result {
            tracing::warn!("Discarding partial download {:?}: {}", temp_path, e);
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, &output_path)?;
        Ok(output_path)
    }

    /// Size of the file `repo` names, or of its first weight file
    pub async fn get_file_size(&self, repo: &HubRepo) -> Result<u64, DownloadError> {
        let weights = match &repo.file {
            Some(file) => file.clone(),
            None => {
                let file_names = self.get_filenames(repo).await?;
                match file_names.into_iter().find(|f| is_weight_file(f)) {
                    Some(file) => file,
                    None => return Ok(FALLBACK_MODEL_SIZE),
                }
            }
        };

        let response = self.http.head(self.file_url(repo, &weights)).send().await?;
        if !response.status().is_success() {
            return Ok(FALLBACK_MODEL_SIZE);
        }

        // LFS files answer with a redirect stub; the real size is in x-linked-size
        let size = ["x-linked-size", CONTENT_LENGTH.as_str()]
            .iter()
            .filter_map(|name| response.headers().get(*name))
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| value.parse::<u64>().ok());

        Ok(size.unwrap_or(FALLBACK_MODEL_SIZE))
    }
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}
