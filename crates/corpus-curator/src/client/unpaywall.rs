//! Open-access full text via Unpaywall.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{HttpClient, param};
use crate::config::Config;
use crate::dedup::normalize_doi;
use crate::error::{ClientError, ServiceError, ServiceResult};
use crate::services::FullTextResolver;

const SERVICE: &str = "unpaywall";

/// Shorter documents are landing pages, not full text.
const MIN_TEXT_CHARS: usize = 500;

static SCRIPTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b.*?</(?:script|style|noscript)>").expect("valid regex")
});
static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Plain text from an HTML document.
#[must_use]
pub fn strip_markup(html: &str) -> String {
    let text = SCRIPTS.replace_all(html, " ");
    let text = TAGS.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    SPACE.replace_all(&text, " ").trim().to_string()
}

#[derive(Debug, Default, Deserialize)]
struct UnpaywallRecord {
    best_oa_location: Option<OaLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct OaLocation {
    url: Option<String>,
    url_for_landing_page: Option<String>,
    url_for_pdf: Option<String>,
}

impl OaLocation {
    /// HTML locations first; PDFs are not parsed.
    fn html_url(&self) -> Option<&str> {
        let is_pdf = |u: &&String| self.url_for_pdf.as_ref() == Some(*u);
        self.url
            .as_ref()
            .filter(|u| !is_pdf(u))
            .or(self.url_for_landing_page.as_ref())
            .map(String::as_str)
    }
}

/// Full-text resolver backed by the Unpaywall API.
#[derive(Clone)]
pub struct UnpaywallResolver {
    http: HttpClient,
    base_url: String,
    email: Option<String>,
}

impl UnpaywallResolver {
    /// Create a new resolver with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpClient::new(config, reqwest::header::HeaderMap::new())?,
            base_url: config.unpaywall_url.clone(),
            email: config.unpaywall_email.clone(),
        })
    }
}

#[async_trait::async_trait]
impl FullTextResolver for UnpaywallResolver {
    async fn resolve(&self, doi: &str) -> ServiceResult<Option<String>> {
        let Some(email) = self.email.as_deref() else {
            return Err(ServiceError::permanent(SERVICE, "UNPAYWALL_EMAIL is not configured"));
        };
        let Some(doi) = normalize_doi(doi) else {
            return Ok(None);
        };

        let url = format!("{}/{}", self.base_url, doi);
        let value = match self.http.get_json(&url, &[param("email", email)]).await {
            Ok(value) => value,
            Err(ClientError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(ServiceError::from_client(SERVICE, e)),
        };
        let record: UnpaywallRecord = serde_json::from_value(value)
            .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;

        let Some(location_url) = record.best_oa_location.as_ref().and_then(OaLocation::html_url) else {
            return Ok(None);
        };
        let (content_type, body) = self
            .http
            .get_text(location_url)
            .await
            .map_err(|e| ServiceError::from_client(SERVICE, e))?;

        let text = match content_type.as_deref() {
            Some(ct) if ct.contains("pdf") => return Ok(None),
            Some(ct) if ct.contains("html") => strip_markup(&body),
            _ => body.trim().to_string(),
        };
        tracing::debug!(doi = %doi, chars = text.len(), "Resolved open-access text");
        Ok((text.chars().count() >= MIN_TEXT_CHARS).then_some(text))
    }
}

impl std::fmt::Debug for UnpaywallResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpaywallResolver").field("has_email", &self.email.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_markup() {
        let html = "<html><head><style>p{}</style><script>var x = 1;</script></head>\
                    <body><p>Sleep &amp; memory</p>\n<p>are   linked.</p></body></html>";
        assert_eq!(strip_markup(html), "Sleep & memory are linked.");
    }

    #[test]
    fn test_html_url_skips_pdf() {
        let location = OaLocation {
            url: Some("https://x/a.pdf".to_string()),
            url_for_landing_page: Some("https://x/a".to_string()),
            url_for_pdf: Some("https://x/a.pdf".to_string()),
        };
        assert_eq!(location.html_url(), Some("https://x/a"));
    }
}
