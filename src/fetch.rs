//! Archived-page fetching and normalization.
//!
//! Fetches the raw capture (the `id_` replay form, which serves the page
//! without the archive's rewriting), rejects non-HTML payloads, strips any
//! archive-injected toolbar markup, and extracts title/description/
//! thumbnail plus the visible text. The content hash is computed over the
//! normalized text only, so the same page always hashes the same no matter
//! which archive mirror served it.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use url::Url;

use crate::resolver::SnapshotCandidate;
use crate::retry::RetryPolicy;

/// Input cap for embedding text (characters).
const MAX_EMBED_INPUT: usize = 1_000;

/// Archive toolbar markers injected into non-raw replays.
const TOOLBAR_BEGIN: &str = "<!-- BEGIN WAYBACK TOOLBAR INSERT -->";
const TOOLBAR_END: &str = "<!-- END WAYBACK TOOLBAR INSERT -->";

#[derive(Debug, Clone)]
pub struct NormalizedContent {
    pub title: String,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Visible page text, whitespace-collapsed.
    pub text: String,
    pub domain: String,
    pub content_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("content fetch failed: {0}")]
    Upstream(String),

    #[error("unsupported content: {0}")]
    UnsupportedContent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Upstream(_))
    }
}

/// Raw document as served by the archive.
pub struct FetchedDocument {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait ContentFetch: Send + Sync {
    async fn fetch_raw(&self, candidate: &SnapshotCandidate) -> Result<FetchedDocument, FetchError>;
}

/// HTTP client against the archive's replay endpoint.
pub struct ReplayClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ReplayClient {
    pub fn new(http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Upstream(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("replay returned {status}")));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Upstream(e.to_string()))?;

        Ok(FetchedDocument {
            content_type,
            body: body.into(),
        })
    }
}

#[async_trait]
impl ContentFetch for ReplayClient {
    async fn fetch_raw(&self, candidate: &SnapshotCandidate) -> Result<FetchedDocument, FetchError> {
        let url = raw_snapshot_url(&candidate.archive_url, &candidate.timestamp);
        self.retry
            .run("content fetch", FetchError::is_transient, || {
                self.fetch_once(&url)
            })
            .await
    }
}

/// Rewrite a replay URL into its raw (`id_`) form, which serves the
/// original bytes without archive rewriting.
pub fn raw_snapshot_url(archive_url: &str, timestamp: &str) -> String {
    let marker = format!("/{timestamp}/");
    match archive_url.find(&marker) {
        Some(pos) => {
            let (head, tail) = archive_url.split_at(pos + 1 + timestamp.len());
            format!("{head}id_{tail}")
        }
        None => archive_url.to_string(),
    }
}

/// Fetches a candidate and normalizes it into exhibit content.
pub struct ContentFetcher {
    client: std::sync::Arc<dyn ContentFetch>,
}

impl ContentFetcher {
    pub fn new(client: std::sync::Arc<dyn ContentFetch>) -> Self {
        Self { client }
    }

    pub async fn fetch(
        &self,
        candidate: &SnapshotCandidate,
        original_url: &str,
    ) -> Result<NormalizedContent, FetchError> {
        let doc = self.client.fetch_raw(candidate).await?;

        if let Some(ref ct) = doc.content_type {
            let ct = ct.to_lowercase();
            if !ct.contains("text/html") && !ct.contains("application/xhtml") {
                return Err(FetchError::UnsupportedContent(ct));
            }
        }

        let html = String::from_utf8_lossy(&doc.body);
        if doc.content_type.is_none() && !looks_like_html(&html) {
            return Err(FetchError::UnsupportedContent("not an HTML document".into()));
        }

        Ok(normalize_document(&html, original_url))
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body
        .get(..body.len().min(512))
        .unwrap_or(body)
        .to_lowercase();
    head.contains("<!doctype html") || head.contains("<html") || head.contains("<head")
}

/// Extract metadata and visible text from an archived page.
pub fn normalize_document(html: &str, original_url: &str) -> NormalizedContent {
    let cleaned = strip_archive_chrome(html);
    let document = scraper::Html::parse_document(&cleaned);

    let (title, description, thumbnail_url) = extract_metadata(&document, original_url);
    let text = extract_text(&document);
    let domain = extract_domain(original_url);
    let content_hash = content_hash(&text);

    NormalizedContent {
        title: title.unwrap_or_else(|| domain.clone()),
        description,
        thumbnail_url,
        text,
        domain,
        content_hash,
    }
}

/// Remove archive-injected toolbar blocks and scripts/styles before
/// parsing. The raw replay usually has none, but mirrors that only serve
/// the rewritten form do.
fn strip_archive_chrome(html: &str) -> String {
    let mut out = match (html.find(TOOLBAR_BEGIN), html.find(TOOLBAR_END)) {
        (Some(begin), Some(end)) if end > begin => {
            let mut s = String::with_capacity(html.len());
            s.push_str(&html[..begin]);
            s.push_str(&html[end + TOOLBAR_END.len()..]);
            s
        }
        _ => html.to_string(),
    };
    out = strip_tag_blocks(&out, "script");
    out = strip_tag_blocks(&out, "style");
    out
}

/// Remove every `<tag …>…</tag>` block, case-insensitively.
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    // ascii-only lowering keeps byte offsets aligned with the original
    let lower: String = html.chars().map(|c| c.to_ascii_lowercase()).collect();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some(start) = lower[pos..].find(&open) {
        let start = pos + start;
        out.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(end) => pos = start + end + close.len(),
            None => {
                // unterminated block, drop the rest
                return out;
            }
        }
    }
    out.push_str(&html[pos..]);
    out
}

fn extract_metadata(
    document: &scraper::Html,
    original_url: &str,
) -> (Option<String>, Option<String>, Option<String>) {
    let head_selector = scraper::Selector::parse("head").unwrap();
    let meta_selector = scraper::Selector::parse("meta").unwrap();
    let title_selector = scraper::Selector::parse("title").unwrap();

    let mut title = None;
    let mut description = None;
    let mut thumbnail = None;

    let head = match document.select(&head_selector).next() {
        Some(h) => h,
        None => return (None, None, None),
    };

    for element in head.select(&meta_selector) {
        let meta_prop = element.attr("property").unwrap_or_default();
        let meta_key = element.attr("name").unwrap_or(meta_prop);
        let meta_value = element.attr("content").unwrap_or_default().trim();
        if meta_value.is_empty() {
            continue;
        }

        if title.is_none() && ["og:title", "twitter:title"].contains(&meta_key) {
            title = Some(meta_value.to_string());
        }
        if description.is_none()
            && ["description", "Description", "og:description", "twitter:description"]
                .contains(&meta_key)
        {
            description = Some(meta_value.to_string());
        }
        if thumbnail.is_none() && ["og:image", "twitter:image"].contains(&meta_key) {
            thumbnail = Some(meta_value.to_string());
        }
    }

    if title.is_none() {
        title = head
            .select(&title_selector)
            .next()
            .and_then(|el| el.text().next())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }

    let thumbnail = thumbnail.and_then(|img| absolutize(&img, original_url));

    (title, description, thumbnail)
}

/// Resolve a possibly relative or protocol-relative URL against the page URL.
fn absolutize(href: &str, page_url: &str) -> Option<String> {
    if href.starts_with("//") {
        return Some(format!("https:{href}"));
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base = Url::parse(page_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

fn extract_text(document: &scraper::Html) -> String {
    let body_selector = scraper::Selector::parse("body").unwrap();
    let raw: String = match document.select(&body_selector).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => return String::new(),
    };
    // collapse all whitespace runs so hashing is layout-independent
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized domain of a URL: lowercased host with any `www.` prefix
/// stripped, so search filters match however the URL was typed.
pub fn extract_domain(url: &str) -> String {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

/// Canonical form of a URL for fingerprint keys: lowercased host, https
/// for protocol-relative input, trailing slash trimmed off non-root paths.
pub fn canonical_url(url: &str) -> String {
    let to_parse = if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    };
    let mut parsed = match Url::parse(&to_parse) {
        Ok(u) => u,
        Err(_) => return url.to_string(),
    };
    if let Some(host) = parsed.host_str() {
        let lowered = host.to_lowercase();
        if parsed.set_host(Some(&lowered)).is_err() {
            return url.to_string();
        }
    }
    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }
    parsed.to_string()
}

/// SHA-256 hex digest of normalized text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Text blob handed to the embedding provider: title, description and
/// leading body text, capped so provider cost stays bounded.
pub fn embedding_input(content: &NormalizedContent) -> String {
    let mut parts = vec![content.title.trim().to_string()];
    if let Some(ref desc) = content.description {
        if !desc.trim().is_empty() {
            parts.push(desc.trim().to_string());
        }
    }
    if !content.text.is_empty() {
        parts.push(content.text.clone());
    }
    let joined = parts.join(" - ");
    if joined.len() <= MAX_EMBED_INPUT {
        return joined;
    }
    joined.chars().take(MAX_EMBED_INPUT).collect()
}
