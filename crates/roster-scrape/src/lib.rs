//! Profile and online-presence collaborators: HTTP fetching plus
//! selector-driven parsing of the site's profile and online pages.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use roster_core::{ProfileRecord, Target, IDENTITY_COLUMN, PROFILE_LINK_COLUMN, SOURCE_COLUMN};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "roster-scrape";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid url {0}")]
    Url(String),
    #[error("profile page for {0} has no recognizable fields")]
    EmptyProfile(String),
}

/// Fetches one profile per identity.
#[async_trait]
pub trait ProfileScraper: Send + Sync {
    async fn fetch_profile(&self, target: &Target) -> Result<ProfileRecord, ScrapeError>;
}

/// Lists identities currently shown as online.
#[async_trait]
pub trait OnlineScraper: Send + Sync {
    async fn fetch_online(&self) -> Result<Vec<Target>, ScrapeError>;
}

/// What a failed page fetch means for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchVerdict {
    /// The site asked us to slow down (429).
    Throttled,
    /// Server or network trouble that usually clears on its own.
    Transient,
    /// Missing profile, bad request and the like.
    Final,
}

impl FetchVerdict {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::Throttled,
            s if s.is_server_error() => Self::Transient,
            _ => Self::Final,
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient
        } else {
            Self::Final
        }
    }
}

/// Page-fetch pacing. Waits double from `first_wait` up to `longest_wait`;
/// a throttled response starts one step further along the curve.
#[derive(Debug, Clone, Copy)]
pub struct FetchBackoff {
    /// Retries after the first request.
    pub retries: usize,
    pub first_wait: Duration,
    pub longest_wait: Duration,
}

impl Default for FetchBackoff {
    fn default() -> Self {
        Self {
            retries: 2,
            first_wait: Duration::from_millis(500),
            longest_wait: Duration::from_secs(5),
        }
    }
}

impl FetchBackoff {
    /// Wait before retry number `retry` (0-based), or `None` once the verdict
    /// or the retry budget rules another request out.
    pub fn wait_before(&self, retry: usize, verdict: FetchVerdict) -> Option<Duration> {
        if verdict == FetchVerdict::Final || retry >= self.retries {
            return None;
        }
        let step = match verdict {
            FetchVerdict::Throttled => retry.saturating_add(1),
            _ => retry,
        };
        let factor = u32::try_from(step)
            .ok()
            .and_then(|s| 1u32.checked_shl(s))
            .unwrap_or(u32::MAX);
        Some(self.first_wait.saturating_mul(factor).min(self.longest_wait))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: FetchBackoff,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: FetchBackoff::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: FetchBackoff,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, ScrapeError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, ScrapeError> {
        let mut retry = 0usize;
        loop {
            let (verdict, failure) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.text().await?),
                Ok(resp) => {
                    let status = resp.status();
                    let failure = ScrapeError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (FetchVerdict::from_status(status), failure)
                }
                Err(err) => (FetchVerdict::from_transport(&err), ScrapeError::Request(err)),
            };

            let Some(wait) = self.backoff.wait_before(retry, verdict) else {
                return Err(failure);
            };
            debug!(retry, ?verdict, wait_ms = wait.as_millis() as u64, error = %failure, "retrying fetch");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSelectorRules {
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

/// Where one column's value lives on the profile page.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub selector: String,
    /// Read this attribute instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Take the first matching element whose text starts with this label,
    /// keeping what follows it.
    #[serde(default)]
    pub label: Option<String>,
    /// Resolve the extracted value against the site base URL.
    #[serde(default)]
    pub absolute_url: bool,
}

impl ProfileSelectorRules {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let rules: Self = serde_yaml::from_str(text)?;
        for rule in &rules.fields {
            parse_selector(&rule.selector)?;
        }
        Ok(rules)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    normalize_text(&element.text().collect::<String>())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn strip_label<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let head = text.get(..label.len())?;
    if head.eq_ignore_ascii_case(label) {
        text.get(label.len()..)
    } else {
        None
    }
}

fn extract_rule(document: &Html, rule: &FieldRule) -> Result<Option<String>, ScrapeError> {
    let sel = parse_selector(&rule.selector)?;
    let value = if let Some(label) = &rule.label {
        document
            .select(&sel)
            .map(element_text)
            .find_map(|text| strip_label(&text, label).map(|rest| rest.trim().to_string()))
            .and_then(text_or_none)
    } else if let Some(attr) = &rule.attr {
        document
            .select(&sel)
            .next()
            .and_then(|n| n.value().attr(attr))
            .and_then(|s| text_or_none(s.to_string()))
    } else {
        document
            .select(&sel)
            .next()
            .and_then(|n| text_or_none(element_text(n)))
    };
    Ok(value)
}

fn resolve_url(base: &Url, value: &str) -> Result<String, ScrapeError> {
    base.join(value)
        .map(|u| u.to_string())
        .map_err(|e| ScrapeError::Url(format!("{value}: {e}")))
}

pub fn profile_url(base: &Url, nickname: &str) -> Result<Url, ScrapeError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ScrapeError::Url(base.to_string()))?
        .pop_if_empty()
        .extend(["users", nickname, ""]);
    Ok(url)
}

/// Builds a record from a profile page. Identity, profile link and source
/// come from the target; every other column from the selector rules.
pub fn parse_profile_page(
    html: &str,
    target: &Target,
    rules: &ProfileSelectorRules,
    base: &Url,
) -> Result<ProfileRecord, ScrapeError> {
    let document = Html::parse_document(html);
    let mut record = ProfileRecord::new();
    let mut extracted = 0usize;

    for rule in &rules.fields {
        let Some(value) = extract_rule(&document, rule)? else {
            continue;
        };
        let value = if rule.absolute_url {
            resolve_url(base, &value)?
        } else {
            value
        };
        record = record.with_field(rule.field.clone(), value);
        extracted += 1;
    }

    if extracted == 0 && !rules.fields.is_empty() {
        return Err(ScrapeError::EmptyProfile(target.nickname.clone()));
    }

    Ok(record
        .with_field(IDENTITY_COLUMN, target.nickname.trim())
        .with_field(
            PROFILE_LINK_COLUMN,
            profile_url(base, target.nickname.trim())?.to_string(),
        )
        .with_field(SOURCE_COLUMN, target.source.clone()))
}

/// Online listings sometimes include counters or one-letter badges; a usable
/// nickname has at least three characters and at least one letter.
fn plausible_nickname(nick: &str) -> bool {
    nick.chars().count() >= 3
        && !nick.chars().all(|c| c.is_ascii_digit())
        && nick.chars().any(char::is_alphabetic)
}

pub fn parse_online_page(html: &str) -> Result<Vec<String>, ScrapeError> {
    let document = Html::parse_document(html);
    let item_sel = parse_selector("li.mbl.cl.sp")?;
    let bold_sel = parse_selector("b")?;

    let mut nicknames: Vec<String> = document
        .select(&item_sel)
        .filter_map(|li| li.select(&bold_sel).next().map(element_text))
        .filter(|nick| plausible_nickname(nick))
        .collect();

    if nicknames.is_empty() {
        let link_sel = parse_selector("a[href*='/users/']")?;
        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let Some((_, tail)) = href.rsplit_once("/users/") else {
                continue;
            };
            let nick = tail.trim_end_matches('/').trim();
            if plausible_nickname(nick) && !nicknames.iter().any(|n| n == nick) {
                nicknames.push(nick.to_string());
            }
        }
    }

    Ok(nicknames)
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub base_url: String,
    pub online_path: String,
    pub http: HttpClientConfig,
}

/// HTTP-backed implementation of both scraper collaborators.
pub struct SiteScraper {
    http: HttpFetcher,
    base: Url,
    online_path: String,
    rules: ProfileSelectorRules,
}

impl SiteScraper {
    pub fn new(config: SiteConfig, rules: ProfileSelectorRules) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing site url {}", config.base_url))?;
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            base,
            online_path: config.online_path,
            rules,
        })
    }
}

#[async_trait]
impl ProfileScraper for SiteScraper {
    async fn fetch_profile(&self, target: &Target) -> Result<ProfileRecord, ScrapeError> {
        let url = profile_url(&self.base, target.nickname.trim())?;
        let html = self.http.fetch_text(url.as_str()).await?;
        parse_profile_page(&html, target, &self.rules, &self.base)
    }
}

#[async_trait]
impl OnlineScraper for SiteScraper {
    async fn fetch_online(&self) -> Result<Vec<Target>, ScrapeError> {
        let url = resolve_url(&self.base, &self.online_path)?;
        let html = self.http.fetch_text(&url).await?;
        let nicknames = parse_online_page(&html)?;
        if nicknames.is_empty() {
            warn!(url, "online page listed no nicknames");
        }
        Ok(nicknames.into_iter().map(Target::online).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
version: 1
fields:
  - field: IMAGE
    selector: "img.profile-pic"
    attr: src
    absolute_url: true
  - field: CITY
    selector: "div.row"
    label: "City:"
  - field: GENDER
    selector: "div.row"
    label: "Gender:"
  - field: INTRO
    selector: "p.intro"
  - field: LAST POST
    selector: "a.last-post"
    attr: href
    absolute_url: true
"#;

    fn base() -> Url {
        Url::parse("https://site.example").unwrap()
    }

    fn target(nick: &str) -> Target {
        Target {
            nickname: nick.to_string(),
            row: Some(2),
            source: "Manual".to_string(),
        }
    }

    #[test]
    fn profile_page_fields_follow_selector_rules() {
        let rules = ProfileSelectorRules::from_yaml(RULES).unwrap();
        let html = r#"
            <html><body>
              <img class="profile-pic" src="/media/bob.jpg">
              <div class="row">City:   Lahore </div>
              <div class="row">Gender: Male</div>
              <p class="intro">hello
                 there</p>
              <a class="last-post" href="/comments/text/991/">post</a>
            </body></html>"#;

        let record = parse_profile_page(html, &target(" Bob "), &rules, &base()).unwrap();
        assert_eq!(record.get("NICK NAME"), "Bob");
        assert_eq!(record.get("IMAGE"), "https://site.example/media/bob.jpg");
        assert_eq!(record.get("CITY"), "Lahore");
        assert_eq!(record.get("GENDER"), "Male");
        assert_eq!(record.get("INTRO"), "hello there");
        assert_eq!(record.get("LAST POST"), "https://site.example/comments/text/991/");
        assert_eq!(record.get("PROFILE LINK"), "https://site.example/users/Bob/");
        assert_eq!(record.get("SOURCE"), "Manual");
        assert_eq!(record.get("MARRIED"), "");
    }

    #[test]
    fn page_without_any_rule_match_is_rejected() {
        let rules = ProfileSelectorRules::from_yaml(RULES).unwrap();
        let err = parse_profile_page("<html><body>gone</body></html>", &target("ghost"), &rules, &base())
            .unwrap_err();
        assert!(matches!(err, ScrapeError::EmptyProfile(n) if n == "ghost"));
    }

    #[test]
    fn invalid_selectors_fail_at_load_time() {
        let bad = "version: 1\nfields:\n  - field: CITY\n    selector: \"div[\"\n";
        assert!(ProfileSelectorRules::from_yaml(bad).is_err());
    }

    #[test]
    fn bundled_rules_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/profile_selectors.yaml");
        let rules = ProfileSelectorRules::from_path(path).unwrap();
        assert!(!rules.fields.is_empty());
    }

    #[test]
    fn online_list_reads_bold_names_and_skips_noise() {
        let html = r#"
            <ul>
              <li class="mbl cl sp"><b>alice_99</b> online</li>
              <li class="mbl cl sp"><b>12345</b></li>
              <li class="mbl cl sp"><b>Zo</b></li>
              <li class="mbl cl sp"><b> Karachi King </b></li>
            </ul>"#;
        assert_eq!(
            parse_online_page(html).unwrap(),
            vec!["alice_99".to_string(), "Karachi King".to_string()]
        );
    }

    #[test]
    fn online_list_falls_back_to_profile_links() {
        let html = r#"
            <div>
              <a href="https://site.example/users/bob_k/">bob</a>
              <a href="/users/bob_k/">again</a>
              <a href="/users/777/">digits</a>
              <a href="/users/amy.r">amy</a>
            </div>"#;
        assert_eq!(
            parse_online_page(html).unwrap(),
            vec!["bob_k".to_string(), "amy.r".to_string()]
        );
    }

    #[test]
    fn profile_urls_are_built_under_users() {
        assert_eq!(
            profile_url(&base(), "bob").unwrap().as_str(),
            "https://site.example/users/bob/"
        );
        let nested = Url::parse("https://site.example/app/").unwrap();
        assert_eq!(
            profile_url(&nested, "amy").unwrap().as_str(),
            "https://site.example/app/users/amy/"
        );
    }

    #[test]
    fn fetch_waits_double_until_the_cap_and_stop_on_final_failures() {
        let backoff = FetchBackoff {
            retries: 4,
            first_wait: Duration::from_millis(250),
            longest_wait: Duration::from_millis(900),
        };
        let transient: Vec<_> = (0..5)
            .map(|i| backoff.wait_before(i, FetchVerdict::Transient).map(|d| d.as_millis()))
            .collect();
        assert_eq!(transient, vec![Some(250), Some(500), Some(900), Some(900), None]);
        assert_eq!(
            backoff.wait_before(0, FetchVerdict::Throttled),
            Some(Duration::from_millis(500))
        );
        assert_eq!(backoff.wait_before(0, FetchVerdict::Final), None);

        assert_eq!(FetchVerdict::from_status(StatusCode::BAD_GATEWAY), FetchVerdict::Transient);
        assert_eq!(FetchVerdict::from_status(StatusCode::TOO_MANY_REQUESTS), FetchVerdict::Throttled);
        assert_eq!(FetchVerdict::from_status(StatusCode::NOT_FOUND), FetchVerdict::Final);
    }
}
