use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::error::{AppError, Result};
use crate::tools::{PageContent, SearchResult, ToolError, ToolGateway};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; marketflow/0.1)";

/// Search via a Serper-compatible endpoint and fetch pages over plain HTTP.
pub struct WebGateway {
    client: Client,
    api_key: String,
    endpoint: String,
    num_results: usize,
    max_page_chars: usize,
    max_page_bytes: usize,
    timeout: Duration,
}

impl WebGateway {
    /// Returns `None` when no search credential is configured.
    pub fn from_config(config: &SearchConfig) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Some(Self {
            client,
            api_key,
            endpoint: config.endpoint.clone(),
            num_results: config.num_results,
            max_page_chars: config.max_page_chars,
            max_page_bytes: config.max_page_bytes.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        }))
    }

    fn transport_error(&self, e: reqwest::Error) -> ToolError {
        if e.is_timeout() {
            ToolError::Timeout(self.timeout)
        } else {
            ToolError::Unknown(e.to_string())
        }
    }

    fn status_error(&self, status: StatusCode, context: &str) -> ToolError {
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                ToolError::Timeout(self.timeout)
            }
            other => map_status(other, context),
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    q: &'a str,
    num: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

#[async_trait]
impl ToolGateway for WebGateway {
    async fn search(&self, query: &str) -> std::result::Result<Vec<SearchResult>, ToolError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&SearchRequest {
                q: query,
                num: self.num_results,
            })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &body));
        }

        let body = response
            .json::<SearchResponse>()
            .await
            .map_err(|e| ToolError::Unknown(format!("Invalid search response: {e}")))?;

        Ok(body
            .organic
            .into_iter()
            .take(self.num_results)
            .map(|r| SearchResult {
                title: r.title,
                snippet: r.snippet,
                link: r.link,
            })
            .collect())
    }

    async fn fetch(&self, url: &str) -> std::result::Result<PageContent, ToolError> {
        let url = normalize_url(url);

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, &url));
        }

        let mut body = Vec::new();
        let mut capped = false;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            if push_capped(&mut body, &chunk, self.max_page_bytes) {
                tracing::debug!(url = %url, limit = self.max_page_bytes, "Page body cut at byte limit");
                capped = true;
                break;
            }
        }
        let html = String::from_utf8_lossy(&body);
        let title = extract_title(&html);
        let (text, truncated) = truncate_chars(&html_to_text(&html), self.max_page_chars);
        let truncated = truncated || capped;

        Ok(PageContent {
            url,
            title,
            text,
            truncated,
        })
    }
}

fn map_status(status: StatusCode, context: &str) -> ToolError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => ToolError::NotFound(context.to_string()),
        StatusCode::TOO_MANY_REQUESTS => ToolError::RateLimited(context.to_string()),
        other => ToolError::Unknown(format!("HTTP {other}: {context}")),
    }
}

/// Append `chunk` without letting `buf` grow past `cap` bytes. Returns true
/// once the cap is reached.
fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    buf.len() >= cap
}

/// Bare domains are fetched over HTTPS.
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

struct HtmlPatterns {
    scripts: Regex,
    comments: Regex,
    tags: Regex,
    title: Regex,
}

impl HtmlPatterns {
    fn compile() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            scripts: Regex::new(
                r"(?is)<(script|style|noscript|template)\b.*?</(script|style|noscript|template)\s*>",
            )?,
            comments: Regex::new(r"(?s)<!--.*?-->")?,
            tags: Regex::new(r"(?s)<[^>]*>")?,
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>")?,
        })
    }
}

/// `None` if the patterns failed to compile; callers fall back to a plain
/// tag stripper.
fn patterns() -> Option<&'static HtmlPatterns> {
    static PATTERNS: OnceLock<Option<HtmlPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| match HtmlPatterns::compile() {
            Ok(patterns) => Some(patterns),
            Err(e) => {
                tracing::warn!(error = %e, "HTML patterns unavailable, using plain tag stripping");
                None
            }
        })
        .as_ref()
}

fn extract_title(html: &str) -> Option<String> {
    patterns()?
        .title
        .captures(html)
        .map(|caps| decode_entities(caps[1].trim()))
        .filter(|t| !t.is_empty())
}

/// Strip markup and collapse whitespace into one phrase per line.
pub(crate) fn html_to_text(html: &str) -> String {
    let stripped = match patterns() {
        Some(p) => {
            let without_scripts = p.scripts.replace_all(html, " ");
            let without_comments = p.comments.replace_all(&without_scripts, " ");
            p.tags.replace_all(&without_comments, "\n").into_owned()
        }
        None => strip_tags(html),
    };
    let text = decode_entities(&stripped);

    text.lines()
        .flat_map(|line| line.split("  "))
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop everything between `<` and `>`, leaving a line break per tag.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push('\n');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let truncated: String = text.chars().take(max_chars).collect();
    (format!("{truncated}..."), true)
}
