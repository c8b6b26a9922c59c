use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::AppError;

/// Query language of a selector expression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorLanguage {
    #[default]
    Css,
    Xpath,
}

impl fmt::Display for SelectorLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorLanguage::Css => write!(f, "css"),
            SelectorLanguage::Xpath => write!(f, "xpath"),
        }
    }
}

/// A single CSS or XPath expression, optionally extracting an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "selector")]
    pub expression: String,
    #[serde(rename = "type", default)]
    pub language: SelectorLanguage,
    /// Attribute to read instead of the text content (CSS only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Selector {
    pub fn css(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            language: SelectorLanguage::Css,
            attribute: None,
        }
    }

    pub fn xpath(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            language: SelectorLanguage::Xpath,
            attribute: None,
        }
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    fn validate(&self, what: &str) -> Result<(), AppError> {
        if self.expression.trim().is_empty() {
            return Err(AppError::ValidationError(format!(
                "{what} has an empty selector"
            )));
        }
        if self.attribute.is_some() && self.language == SelectorLanguage::Xpath {
            return Err(AppError::ValidationError(format!(
                "{what}: attribute extraction is only supported for CSS selectors; \
                 select the attribute node in the XPath expression instead"
            )));
        }
        Ok(())
    }
}

/// One named extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    pub name: String,
    #[serde(flatten)]
    pub selector: Selector,
    /// In item mode, an item missing this field is dropped.
    #[serde(default)]
    pub required: bool,
}

impl FieldSelector {
    pub fn new(name: impl Into<String>, selector: Selector) -> Self {
        Self {
            name: name.into(),
            selector,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Container-scoped extraction settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemScraping {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub container_selector: String,
    #[serde(default)]
    pub container_type: SelectorLanguage,
    #[serde(default)]
    pub field_selectors: Vec<FieldSelector>,
}

impl ItemScraping {
    pub fn container(&self) -> Selector {
        Selector {
            expression: self.container_selector.clone(),
            language: self.container_type,
            attribute: None,
        }
    }
}

/// The extraction mode a configuration resolves to.
#[derive(Debug, Clone, Copy)]
pub enum ExtractionMode<'a> {
    /// One record per page, every field evaluated against the whole document.
    Flat { fields: &'a [FieldSelector] },
    /// One record per container match, fields evaluated inside the container.
    Item {
        container: &'a ItemScraping,
        fields: &'a [FieldSelector],
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationStyle {
    /// `?page=N` on the query string.
    #[default]
    Query,
    /// `/N` appended to the path, or a `{page}` placeholder substituted.
    Path,
}

/// Range-driven pagination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub style: PaginationStyle,
    #[serde(default = "default_param_name")]
    pub param_name: String,
    #[serde(default = "default_page")]
    pub start_page: u32,
    #[serde(default = "default_page")]
    pub end_page: u32,
}

impl PaginationConfig {
    pub fn query(param_name: impl Into<String>, start_page: u32, end_page: u32) -> Self {
        Self {
            enabled: true,
            style: PaginationStyle::Query,
            param_name: param_name.into(),
            start_page,
            end_page,
        }
    }

    pub fn path(start_page: u32, end_page: u32) -> Self {
        Self {
            enabled: true,
            style: PaginationStyle::Path,
            param_name: default_param_name(),
            start_page,
            end_page,
        }
    }
}

/// Browser backend used when JavaScript rendering is requested.
///
/// `playwright` and `selenium` are accepted for compatibility with
/// existing job files; every engine is driven through the DevTools protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderEngine {
    #[default]
    #[serde(alias = "playwright", alias = "selenium")]
    Chromium,
}

/// Login credentials, accepted either as an object or a `"user,password"` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CredentialRepr")]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialRepr {
    Object {
        #[serde(alias = "user")]
        username: String,
        #[serde(alias = "pass")]
        password: String,
    },
    Line(String),
}

impl TryFrom<CredentialRepr> for Credential {
    type Error = String;

    fn try_from(repr: CredentialRepr) -> Result<Self, Self::Error> {
        match repr {
            CredentialRepr::Object { username, password } => Ok(Self { username, password }),
            CredentialRepr::Line(line) => {
                let (username, password) = line
                    .split_once(',')
                    .ok_or_else(|| "credential strings must look like 'user,password'".to_string())?;
                Ok(Self {
                    username: username.trim().to_string(),
                    password: password.trim().to_string(),
                })
            }
        }
    }
}

/// Form login performed once before pagination starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub url: String,
    pub username_field: String,
    pub password_field: String,
    pub credential: Credential,
}

/// Immutable description of one scrape job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeConfig {
    pub url: String,

    /// Flat-mode fields.
    #[serde(default)]
    pub selectors: Vec<FieldSelector>,

    #[serde(default)]
    pub item_scraping: ItemScraping,

    #[serde(default)]
    pub scrape_images: bool,
    #[serde(default = "default_image_selector")]
    pub image_selector: String,
    #[serde(default)]
    pub download_images: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,

    #[serde(rename = "useJavaScriptRendering", default)]
    pub use_javascript_rendering: bool,
    #[serde(default)]
    pub js_engine: RenderEngine,

    #[serde(default = "default_rate")]
    pub max_requests_per_second: f64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Base backoff delay in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,

    #[serde(default)]
    pub incremental_scraping: bool,

    #[serde(default = "default_true")]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxies: Vec<String>,

    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
}

fn default_true() -> bool {
    true
}
fn default_param_name() -> String {
    "page".to_string()
}
fn default_page() -> u32 {
    1
}
fn default_image_selector() -> String {
    "img".to_string()
}
fn default_rate() -> f64 {
    2.0
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_username_field() -> String {
    "username".to_string()
}
fn default_password_field() -> String {
    "password".to_string()
}

impl ScrapeConfig {
    /// A flat-mode configuration for `url` with default pacing.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selectors: Vec::new(),
            item_scraping: ItemScraping::default(),
            scrape_images: false,
            image_selector: default_image_selector(),
            download_images: false,
            image_dir: None,
            use_javascript_rendering: false,
            js_engine: RenderEngine::default(),
            max_requests_per_second: default_rate(),
            max_retries: default_retries(),
            retry_delay: default_retry_delay(),
            pagination: None,
            incremental_scraping: false,
            use_proxy: true,
            proxies: Vec::new(),
            credentials: Vec::new(),
            login_url: None,
            username_field: default_username_field(),
            password_field: default_password_field(),
        }
    }

    pub fn with_field(mut self, field: FieldSelector) -> Self {
        self.selectors.push(field);
        self
    }

    /// Switch to item mode with the given container and fields.
    pub fn with_items(mut self, container: Selector, fields: Vec<FieldSelector>) -> Self {
        self.item_scraping = ItemScraping {
            enabled: true,
            container_selector: container.expression,
            container_type: container.language,
            field_selectors: fields,
        };
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn with_rate(mut self, max_requests_per_second: f64) -> Self {
        self.max_requests_per_second = max_requests_per_second;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay.as_secs_f64();
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.use_proxy = true;
        self.proxies = proxies;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental_scraping = incremental;
        self
    }

    pub fn with_images(mut self, image_selector: impl Into<String>) -> Self {
        self.scrape_images = true;
        self.image_selector = image_selector.into();
        self
    }

    pub fn mode(&self) -> ExtractionMode<'_> {
        if self.item_scraping.enabled {
            ExtractionMode::Item {
                container: &self.item_scraping,
                fields: &self.item_scraping.field_selectors,
            }
        } else {
            ExtractionMode::Flat {
                fields: &self.selectors,
            }
        }
    }

    /// Proxies to rotate through, empty when proxying is off.
    pub fn active_proxies(&self) -> &[String] {
        if self.use_proxy { &self.proxies } else { &[] }
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }

    pub fn image_selector(&self) -> Option<Selector> {
        self.scrape_images
            .then(|| Selector::css(self.image_selector.clone()))
    }

    pub fn image_dir(&self) -> Option<PathBuf> {
        self.download_images.then(|| {
            self.image_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("images"))
        })
    }

    /// The login form submission, when credentials are configured.
    pub fn login_request(&self) -> Option<LoginRequest> {
        let credential = self.credentials.first()?.clone();
        let url = self
            .login_url
            .clone()
            .unwrap_or_else(|| format!("{}/login", self.url.trim_end_matches('/')));
        Some(LoginRequest {
            url,
            username_field: self.username_field.clone(),
            password_field: self.password_field.clone(),
            credential,
        })
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.url.trim().is_empty() {
            return Err(AppError::ValidationError("url must not be empty".into()));
        }
        let template = self.url.replace("{page}", "1");
        let parsed = Url::parse(&template)
            .map_err(|e| AppError::ValidationError(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::ValidationError(format!(
                "unsupported url scheme '{}': only http and https are allowed",
                parsed.scheme()
            )));
        }

        if !self.max_requests_per_second.is_finite() || self.max_requests_per_second <= 0.0 {
            return Err(AppError::ValidationError(format!(
                "maxRequestsPerSecond must be a positive number, got {}",
                self.max_requests_per_second
            )));
        }
        if !self.retry_delay.is_finite() || self.retry_delay < 0.0 {
            return Err(AppError::ValidationError(format!(
                "retryDelay must be a non-negative number, got {}",
                self.retry_delay
            )));
        }

        match self.mode() {
            ExtractionMode::Flat { fields } => {
                if fields.is_empty() {
                    return Err(AppError::ValidationError(
                        "flat mode requires at least one field selector".into(),
                    ));
                }
                validate_fields(fields)?;
            }
            ExtractionMode::Item { container, fields } => {
                if container.container_selector.trim().is_empty() {
                    return Err(AppError::ValidationError(
                        "item mode requires a container selector".into(),
                    ));
                }
                if fields.is_empty() {
                    return Err(AppError::ValidationError(
                        "item mode requires at least one field selector".into(),
                    ));
                }
                validate_fields(fields)?;
            }
        }

        if self.scrape_images && self.image_selector.trim().is_empty() {
            return Err(AppError::ValidationError(
                "imageSelector must not be empty when scrapeImages is set".into(),
            ));
        }

        if let Some(pagination) = self.pagination.as_ref().filter(|p| p.enabled) {
            if pagination.start_page > pagination.end_page {
                return Err(AppError::ValidationError(format!(
                    "pagination startPage ({}) must not exceed endPage ({})",
                    pagination.start_page, pagination.end_page
                )));
            }
            if pagination.style == PaginationStyle::Query
                && pagination.param_name.trim().is_empty()
            {
                return Err(AppError::ValidationError(
                    "query pagination requires a paramName".into(),
                ));
            }
        }

        if self.active_proxies().iter().any(|p| p.trim().is_empty()) {
            return Err(AppError::ValidationError(
                "proxy addresses must not be empty".into(),
            ));
        }

        Ok(())
    }
}

fn validate_fields(fields: &[FieldSelector]) -> Result<(), AppError> {
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            return Err(AppError::ValidationError(
                "field selectors must have a name".into(),
            ));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(AppError::ValidationError(format!(
                "duplicate field name '{}'",
                field.name
            )));
        }
        field.selector.validate(&format!("field '{}'", field.name))?;
    }
    Ok(())
}

/// Value extracted for one field: a single string, or every match in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    Multiple(Vec<String>),
}

impl FieldValue {
    /// Collapse matches: none becomes an empty string, one stays scalar.
    pub fn from_matches(mut values: Vec<String>) -> Self {
        match values.len() {
            0 => FieldValue::Single(String::new()),
            1 => FieldValue::Single(values.remove(0)),
            _ => FieldValue::Multiple(values),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Single(s) => s.is_empty(),
            FieldValue::Multiple(v) => v.is_empty(),
        }
    }

    /// The first value, if any.
    pub fn first(&self) -> Option<&str> {
        match self {
            FieldValue::Single(s) if !s.is_empty() => Some(s),
            FieldValue::Single(_) => None,
            FieldValue::Multiple(v) => v.first().map(String::as_str),
        }
    }

    /// Flattened text, multiple values joined with `separator`.
    pub fn join(&self, separator: &str) -> String {
        match self {
            FieldValue::Single(s) => s.clone(),
            FieldValue::Multiple(v) => v.join(separator),
        }
    }
}

/// Stable content fingerprint of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DedupKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One extracted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRecord {
    /// Page the record was extracted from.
    pub url: String,
    /// 1-based position of the container on its page (item mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub scraped_at: DateTime<Utc>,
}

impl ExtractedRecord {
    pub fn new(url: impl Into<String>, fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            url: url.into(),
            item_index: None,
            fields,
            images: Vec::new(),
            scraped_at: Utc::now(),
        }
    }

    /// Fingerprint of the field values only; metadata is excluded so the
    /// same content scraped twice yields the same key.
    pub fn fingerprint(&self) -> DedupKey {
        let canonical = serde_json::to_string(&self.fields).unwrap_or_default();
        DedupKey(compute_hash(&canonical))
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_config() -> ScrapeConfig {
        ScrapeConfig::new("https://example.com")
            .with_field(FieldSelector::new("title", Selector::css("h1")))
    }

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Hello \n\t  world  "), "Hello world");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn test_deserialize_ui_payload() {
        let config: ScrapeConfig = serde_json::from_value(serde_json::json!({
            "url": "https://shop.test/products",
            "itemScraping": {
                "enabled": true,
                "containerSelector": "div.product",
                "fieldSelectors": [
                    {"name": "title", "selector": "h2", "required": true},
                    {"name": "link", "selector": "a", "attribute": "href"},
                    {"name": "price", "selector": ".//span[@class='price']", "type": "xpath"}
                ]
            },
            "pagination": {"type": "path", "startPage": 1, "endPage": 3},
            "maxRequestsPerSecond": 0.5,
            "incrementalScraping": true,
            "useJavaScriptRendering": true,
            "jsEngine": "playwright",
            "credentials": ["alice, s3cret", {"user": "bob", "pass": "pw"}]
        }))
        .unwrap();

        assert!(matches!(config.mode(), ExtractionMode::Item { fields, .. } if fields.len() == 3));
        assert!(config.item_scraping.field_selectors[0].required);
        assert_eq!(
            config.item_scraping.field_selectors[2].selector.language,
            SelectorLanguage::Xpath
        );
        assert_eq!(config.js_engine, RenderEngine::Chromium);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.credentials[0].username, "alice");
        assert_eq!(config.credentials[0].password, "s3cret");
        assert_eq!(config.credentials[1].username, "bob");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(matches!(
            ScrapeConfig::new("").validate(),
            Err(AppError::ValidationError(_))
        ));
        assert!(ScrapeConfig::new("https://example.com").validate().is_err());
        assert!(flat_config().with_rate(0.0).validate().is_err());
        assert!(flat_config().with_rate(f64::NAN).validate().is_err());

        let bad_scheme = ScrapeConfig {
            url: "ftp://example.com".into(),
            ..flat_config()
        };
        assert!(bad_scheme.validate().is_err());

        let empty_container = flat_config().with_items(
            Selector::css(""),
            vec![FieldSelector::new("a", Selector::css("a"))],
        );
        assert!(empty_container.validate().is_err());

        let no_fields = flat_config().with_items(Selector::css(".item"), vec![]);
        assert!(no_fields.validate().is_err());

        let reversed = flat_config().with_pagination(PaginationConfig::query("page", 5, 2));
        assert!(reversed.validate().is_err());

        let xpath_attr = ScrapeConfig::new("https://example.com").with_field(FieldSelector::new(
            "link",
            Selector::xpath("//a").with_attribute("href"),
        ));
        assert!(xpath_attr.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_page_placeholder() {
        let config = ScrapeConfig {
            url: "https://example.com/list/{page}".into(),
            ..flat_config()
        }
        .with_pagination(PaginationConfig::path(1, 3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_login_request_defaults_to_login_path() {
        let mut config = flat_config();
        assert!(config.login_request().is_none());
        config.credentials.push(Credential {
            username: "u".into(),
            password: "p".into(),
        });
        let login = config.login_request().unwrap();
        assert_eq!(login.url, "https://example.com/login");
        assert_eq!(login.username_field, "username");
    }

    #[test]
    fn test_fingerprint_ignores_metadata() {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), FieldValue::Single("A".into()));
        let a = ExtractedRecord::new("https://a.test/1", fields.clone());
        let mut b = ExtractedRecord::new("https://a.test/2", fields);
        b.item_index = Some(4);
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.fields
            .insert("title".to_string(), FieldValue::Single("B".into()));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_field_value_shapes() {
        assert_eq!(FieldValue::from_matches(vec![]), FieldValue::Single(String::new()));
        assert!(FieldValue::from_matches(vec![]).is_empty());
        assert_eq!(
            FieldValue::from_matches(vec!["x".into()]),
            FieldValue::Single("x".into())
        );
        let many = FieldValue::from_matches(vec!["x".into(), "y".into()]);
        assert_eq!(serde_json::to_value(&many).unwrap(), serde_json::json!(["x", "y"]));
        assert_eq!(many.join("; "), "x; y");
        assert_eq!(many.first(), Some("x"));
    }
}
