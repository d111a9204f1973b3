//! Snapshot resolution against the archive's CDX index.
//!
//! Queries the paginated capture index for a URL and date range, then
//! applies a deterministic selection policy: only status-200 captures are
//! eligible; with a `to_date` we pick the capture closest to the end of
//! that day, otherwise the most recent one; ties go to the earlier
//! capture. Determinism here is what keeps exhibit ids stable.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::retry::RetryPolicy;

/// Upper bound on captures considered per URL; pages beyond this are ignored.
const MAX_CAPTURES: usize = 10_000;

/// One row of the capture index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// 14-digit YYYYMMDDHHMMSS capture time.
    pub timestamp: String,
    /// The URL as the archive recorded it.
    pub original: String,
    pub status_code: Option<u16>,
}

/// The selected snapshot, handed to the content fetcher.
#[derive(Debug, Clone)]
pub struct SnapshotCandidate {
    pub timestamp: String,
    pub archive_url: String,
    pub status_code: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no archived snapshot found for this URL in the requested range")]
    NoSnapshotFound,

    #[error("snapshot index unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::UpstreamUnavailable(_))
    }
}

/// Abstract capture index, so the orchestrator can be exercised without
/// the real archive service.
#[async_trait]
pub trait SnapshotIndex: Send + Sync {
    async fn captures(
        &self,
        url: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<Vec<Capture>, ResolveError>;
}

/// CDX-API client. Pages through results; each page request is retried
/// with backoff on transient failures.
pub struct CdxClient {
    http: reqwest::Client,
    endpoint: String,
    page_size: usize,
    retry: RetryPolicy,
}

impl CdxClient {
    pub fn new(http: reqwest::Client, endpoint: &str, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            page_size,
            retry,
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
        offset: usize,
    ) -> Result<Vec<Capture>, ResolveError> {
        let mut query: Vec<(&str, String)> = vec![
            ("url", url.to_string()),
            ("output", "json".to_string()),
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(from) = from_date {
            query.push(("from", from.to_string()));
        }
        if let Some(to) = to_date {
            query.push(("to", to.to_string()));
        }

        let resp = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|e| ResolveError::UpstreamUnavailable(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(ResolveError::NoSnapshotFound);
        }
        if status.is_client_error() && status.as_u16() != 429 {
            // malformed/blocked input will not get better with retries
            return Err(ResolveError::NoSnapshotFound);
        }
        if !status.is_success() {
            return Err(ResolveError::UpstreamUnavailable(format!(
                "index returned {status}"
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| ResolveError::UpstreamUnavailable(e.to_string()))?;
        if body.is_empty() {
            return Ok(vec![]);
        }

        let rows: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| ResolveError::UpstreamUnavailable(format!("bad index payload: {e}")))?;
        Ok(parse_cdx_rows(&rows))
    }
}

#[async_trait]
impl SnapshotIndex for CdxClient {
    async fn captures(
        &self,
        url: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<Vec<Capture>, ResolveError> {
        let mut all = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .retry
                .run("cdx query", ResolveError::is_transient, || {
                    self.fetch_page(url, from_date, to_date, offset)
                })
                .await?;

            let page_len = page.len();
            all.extend(page);

            if page_len < self.page_size || all.len() >= MAX_CAPTURES {
                break;
            }
            offset += self.page_size;
        }

        Ok(all)
    }
}

/// Parse the CDX JSON response: an array of arrays whose first row is the
/// column header. Rows with an unparseable timestamp are dropped.
fn parse_cdx_rows(value: &serde_json::Value) -> Vec<Capture> {
    let rows = match value.as_array() {
        Some(rows) => rows,
        None => return vec![],
    };

    rows.iter()
        .skip(1) // header row
        .filter_map(|row| {
            let row = row.as_array()?;
            let timestamp = row.get(1)?.as_str()?.to_string();
            if timestamp.len() != 14 || !timestamp.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let original = row.get(2)?.as_str()?.to_string();
            let status_code = row
                .get(4)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
            Some(Capture {
                timestamp,
                original,
                status_code,
            })
        })
        .collect()
}

fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, "%Y%m%d%H%M%S").ok()
}

/// Selection policy over the capture list. Returns `None` when no
/// status-200 capture exists.
pub fn select_capture<'a>(captures: &'a [Capture], to_date: Option<&str>) -> Option<&'a Capture> {
    let target = to_date
        .map(|d| format!("{d}235959"))
        .and_then(|t| parse_timestamp(&t));

    captures
        .iter()
        .filter(|c| c.status_code == Some(200))
        .filter_map(|c| parse_timestamp(&c.timestamp).map(|t| (c, t)))
        .min_by_key(|(c, t)| match target {
            // closest to the end of to_date; equal distance prefers the
            // earlier capture (stable tie-break)
            Some(target) => ((*t - target).num_seconds().abs(), c.timestamp.clone()),
            // no bound: most recent; encode "latest" as smallest key
            None => (-t.and_utc().timestamp(), c.timestamp.clone()),
        })
        .map(|(c, _)| c)
}

/// Resolves a URL + date range to one concrete snapshot.
pub struct SnapshotResolver {
    index: std::sync::Arc<dyn SnapshotIndex>,
    replay_endpoint: String,
}

impl SnapshotResolver {
    pub fn new(index: std::sync::Arc<dyn SnapshotIndex>, replay_endpoint: &str) -> Self {
        Self {
            index,
            replay_endpoint: replay_endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub async fn resolve(
        &self,
        url: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<SnapshotCandidate, ResolveError> {
        let captures = self.index.captures(url, from_date, to_date).await?;
        let capture = select_capture(&captures, to_date).ok_or(ResolveError::NoSnapshotFound)?;

        log::debug!(
            "resolved {url} to capture {} ({} candidates)",
            capture.timestamp,
            captures.len()
        );

        Ok(SnapshotCandidate {
            timestamp: capture.timestamp.clone(),
            archive_url: format!(
                "{}/{}/{}",
                self.replay_endpoint, capture.timestamp, capture.original
            ),
            status_code: capture.status_code.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(ts: &str, status: Option<u16>) -> Capture {
        Capture {
            timestamp: ts.to_string(),
            original: "http://geocities.example/page".to_string(),
            status_code: status,
        }
    }

    #[test]
    fn test_parse_cdx_rows() {
        let value = serde_json::json!([
            ["urlkey", "timestamp", "original", "mimetype", "statuscode", "digest", "length"],
            ["example)/page", "19991231120000", "http://geocities.example/page", "text/html", "200", "ABC", "1234"],
            ["example)/page", "20000101000000", "http://geocities.example/page", "text/html", "-", "DEF", "99"],
        ]);
        let captures = parse_cdx_rows(&value);
        assert_eq!(captures.len(), 2);
        assert_eq!(captures[0].status_code, Some(200));
        assert_eq!(captures[1].status_code, None);
    }

    #[test]
    fn test_parse_cdx_rows_skips_bad_timestamps() {
        let value = serde_json::json!([
            ["urlkey", "timestamp", "original", "mimetype", "statuscode", "digest", "length"],
            ["example)/page", "1999", "http://geocities.example/page", "text/html", "200", "ABC", "1"],
        ]);
        assert!(parse_cdx_rows(&value).is_empty());
    }

    #[test]
    fn test_select_most_recent_without_to_date() {
        let captures = vec![
            capture("19981001000000", Some(200)),
            capture("20001001000000", Some(200)),
            capture("19991001000000", Some(200)),
        ];
        let selected = select_capture(&captures, None).unwrap();
        assert_eq!(selected.timestamp, "20001001000000");
    }

    #[test]
    fn test_select_ignores_non_200() {
        let captures = vec![
            capture("20001001000000", Some(301)),
            capture("19991001000000", Some(200)),
            capture("20011001000000", None),
        ];
        let selected = select_capture(&captures, None).unwrap();
        assert_eq!(selected.timestamp, "19991001000000");
    }

    #[test]
    fn test_select_none_when_no_good_capture() {
        let captures = vec![capture("20001001000000", Some(404))];
        assert!(select_capture(&captures, None).is_none());
    }

    #[test]
    fn test_select_closest_to_to_date() {
        let captures = vec![
            capture("19980101000000", Some(200)),
            capture("19991230000000", Some(200)),
            capture("20030101000000", Some(200)),
        ];
        let selected = select_capture(&captures, Some("20000101")).unwrap();
        assert_eq!(selected.timestamp, "19991230000000");
    }

    #[test]
    fn test_select_tie_prefers_earlier() {
        // both one day away from the target's end of day
        let captures = vec![
            capture("20000103235959", Some(200)),
            capture("20000101235959", Some(200)),
        ];
        let selected = select_capture(&captures, Some("20000102")).unwrap();
        assert_eq!(selected.timestamp, "20000101235959");
    }

    #[test]
    fn test_selection_is_order_independent() {
        let mut captures = vec![
            capture("19981001000000", Some(200)),
            capture("20001001000000", Some(200)),
            capture("19991001000000", Some(200)),
        ];
        let first = select_capture(&captures, None).unwrap().timestamp.clone();
        captures.reverse();
        let second = select_capture(&captures, None).unwrap().timestamp.clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_resolver_builds_archive_url() {
        struct FixedIndex;

        #[async_trait]
        impl SnapshotIndex for FixedIndex {
            async fn captures(
                &self,
                _url: &str,
                _from: Option<&str>,
                _to: Option<&str>,
            ) -> Result<Vec<Capture>, ResolveError> {
                Ok(vec![Capture {
                    timestamp: "19991231120000".to_string(),
                    original: "http://geocities.example/page".to_string(),
                    status_code: Some(200),
                }])
            }
        }

        let resolver =
            SnapshotResolver::new(std::sync::Arc::new(FixedIndex), "https://web.archive.org/web/");
        let candidate = resolver
            .resolve("http://geocities.example/page", None, None)
            .await
            .unwrap();

        assert_eq!(
            candidate.archive_url,
            "https://web.archive.org/web/19991231120000/http://geocities.example/page"
        );
    }

    #[tokio::test]
    async fn test_resolver_no_snapshot() {
        struct EmptyIndex;

        #[async_trait]
        impl SnapshotIndex for EmptyIndex {
            async fn captures(
                &self,
                _url: &str,
                _from: Option<&str>,
                _to: Option<&str>,
            ) -> Result<Vec<Capture>, ResolveError> {
                Ok(vec![])
            }
        }

        let resolver = SnapshotResolver::new(std::sync::Arc::new(EmptyIndex), "https://w.example");
        let result = resolver.resolve("http://never.example", None, None).await;
        assert!(matches!(result, Err(ResolveError::NoSnapshotFound)));
    }
}
