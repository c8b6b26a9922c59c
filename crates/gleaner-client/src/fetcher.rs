use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::models::LoginRequest;
use gleaner_core::proxy_pool::ProxyEndpoint;
use gleaner_core::traits::{FetchedPage, PageFetcher, UrlCheck};
use moka::future::Cache;
use rand::seq::IndexedRandom;
use reqwest::cookie::Jar;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, Proxy, Response, StatusCode};
use url::Url;

/// Desktop browser identities rotated across requests.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Cache key for the client that goes out without a proxy.
const DIRECT: &str = "";

/// Plain HTTP fetcher using reqwest.
///
/// One `reqwest::Client` is built per egress proxy and cached; every client
/// shares the same cookie jar, so a login session survives proxy rotation.
/// SSRF protection is **enabled** by default: targets resolving to
/// private or reserved addresses are refused. Use
/// [`allow_private_urls`](Self::allow_private_urls) to turn it off for
/// local use.
#[derive(Clone)]
pub struct HttpFetcher {
    clients: Cache<String, Client>,
    cookies: Arc<Jar>,
    timeout: Duration,
    user_agent: Option<String>,
    ssrf_protection: bool,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            clients: Cache::builder()
                .max_capacity(256)
                .time_to_idle(Duration::from_secs(600))
                .build(),
            cookies: Arc::new(Jar::default()),
            timeout,
            user_agent: None,
            ssrf_protection: true,
        }
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    /// Send this User-Agent on every request instead of rotating.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Same settings, fresh cookie jar and client cache.
    pub fn new_session(&self) -> Self {
        let mut fresh = Self::with_timeout(self.timeout);
        fresh.user_agent = self.user_agent.clone();
        fresh.ssrf_protection = self.ssrf_protection;
        fresh
    }

    fn user_agent(&self) -> &str {
        match &self.user_agent {
            Some(fixed) => fixed,
            None => USER_AGENTS
                .choose(&mut rand::rng())
                .copied()
                .unwrap_or(USER_AGENTS[0]),
        }
    }

    async fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, AppError> {
        let key = proxy.map(ProxyEndpoint::address).unwrap_or(DIRECT).to_string();
        let address = proxy.map(|p| p.address().to_string());
        let cookies = Arc::clone(&self.cookies);
        let timeout = self.timeout;

        self.clients
            .try_get_with(key, async move {
                let mut builder = Client::builder()
                    .cookie_provider(cookies)
                    .default_headers(browser_headers())
                    .timeout(timeout)
                    .connect_timeout(Duration::from_secs(10));
                if let Some(address) = &address {
                    let proxy = Proxy::all(address)
                        .map_err(|e| format!("invalid proxy '{address}': {e}"))?;
                    builder = builder.proxy(proxy);
                }
                builder.build().map_err(|e| e.to_string())
            })
            .await
            .map_err(|e: Arc<String>| AppError::ConfigError(e.to_string()))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Response, AppError> {
        if self.ssrf_protection {
            ensure_public(url).await?;
        }
        let client = self.client_for(proxy).await?;
        client
            .request(method, url)
            .header(header::USER_AGENT, self.user_agent())
            .send()
            .await
            .map_err(|e| classify(url, &e))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

/// Map a transport error onto the transient/fatal split.
fn classify(url: &str, error: &reqwest::Error) -> AppError {
    let mut message = error_chain(error);
    if error.is_timeout() && !message.contains("timed out") {
        message = format!("request timed out: {message}");
    }
    if error.is_builder() || is_dns_failure(&message) {
        return AppError::FatalFetch {
            url: url.to_string(),
            status: None,
            message,
        };
    }
    AppError::TransientFetch {
        url: url.to_string(),
        status: None,
        message,
    }
}

fn is_dns_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("dns error") || lower.contains("failed to lookup address")
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn check_status(url: &str, response: &Response) -> Result<(), AppError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(AppError::from_status(url, status.as_u16()))
    }
}

impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchedPage, AppError> {
        let response = self.send(Method::GET, url, proxy).await?;
        check_status(url, &response)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| classify(url, &e))?;

        tracing::debug!(%url, status, bytes = body.len(), "Fetched page");
        Ok(FetchedPage {
            url: final_url,
            status,
            body,
        })
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Vec<u8>, AppError> {
        let response = self.send(Method::GET, url, proxy).await?;
        check_status(url, &response)?;
        let bytes = response.bytes().await.map_err(|e| classify(url, &e))?;
        Ok(bytes.to_vec())
    }

    async fn probe(&self, url: &str) -> Result<UrlCheck, AppError> {
        let mut response = self.send(Method::HEAD, url, None).await;
        if let Ok(head) = &response
            && matches!(
                head.status(),
                StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
            )
        {
            response = self.send(Method::GET, url, None).await;
        }

        Ok(match response {
            Ok(response) => UrlCheck {
                accessible: response.status().is_success(),
                status_code: Some(response.status().as_u16()),
                content_type: response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                final_url: Some(response.url().to_string()),
                error: None,
            },
            Err(e) => UrlCheck {
                accessible: false,
                status_code: None,
                content_type: None,
                final_url: None,
                error: Some(e.to_string()),
            },
        })
    }

    async fn login(
        &self,
        request: &LoginRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<bool, AppError> {
        if self.ssrf_protection {
            ensure_public(&request.url).await?;
        }
        let client = self.client_for(proxy).await?;
        let form = [
            (
                request.username_field.as_str(),
                request.credential.username.as_str(),
            ),
            (
                request.password_field.as_str(),
                request.credential.password.as_str(),
            ),
        ];
        let response = client
            .post(&request.url)
            .header(header::USER_AGENT, self.user_agent())
            .form(&form)
            .send()
            .await
            .map_err(|e| classify(&request.url, &e))?;

        let accepted = response.status().is_success();
        tracing::debug!(url = %request.url, status = response.status().as_u16(), accepted, "Login submitted");
        Ok(accepted)
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Refuse targets that are not http(s) or that resolve to a private,
/// loopback, link-local or otherwise reserved address.
async fn ensure_public(url: &str) -> Result<(), AppError> {
    let blocked = |message: String| AppError::FatalFetch {
        url: url.to_string(),
        status: None,
        message,
    };

    let parsed = Url::parse(url).map_err(|e| blocked(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(blocked(format!(
            "scheme '{}' is not allowed (only http/https)",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| blocked("url has no host".to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let addresses: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| blocked(format!("dns error: failed to lookup address for {host}: {e}")))?
                .map(|addr| addr.ip())
                .collect()
        }
    };

    if addresses.is_empty() {
        return Err(blocked(format!("dns error: no addresses for {host}")));
    }
    if let Some(ip) = addresses.into_iter().find(|ip| is_reserved(*ip)) {
        return Err(blocked(format!(
            "blocked: {host} resolves to reserved address {ip}"
        )));
    }
    Ok(())
}

fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (64..128).contains(&b))
                || (a == 198 && (b == 18 || b == 19))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_reserved(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xffc0) == 0xfe80
                || (first & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::models::Credential;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::with_timeout(Duration::from_secs(5)).allow_private_urls()
    }

    /// A local URL nothing listens on.
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/")
    }

    #[test]
    fn test_reserved_ipv4() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.20.0.1",
            "192.168.0.10",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "198.18.0.1",
        ] {
            assert!(is_reserved(ip.parse().unwrap()), "{ip} should be reserved");
        }
        for ip in ["8.8.8.8", "1.1.1.1", "93.184.216.34"] {
            assert!(!is_reserved(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[test]
    fn test_reserved_ipv6() {
        for ip in ["::1", "::", "fe80::1", "fd00::1", "::ffff:10.0.0.1"] {
            assert!(is_reserved(ip.parse().unwrap()), "{ip} should be reserved");
        }
        assert!(!is_reserved("2606:4700:4700::1111".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_guard_blocks_private_targets() {
        let err = ensure_public("http://127.0.0.1/admin").await.unwrap_err();
        assert!(err.to_string().contains("reserved address"));
        assert!(!err.is_retryable());

        let err = ensure_public("http://[::1]:8080/").await.unwrap_err();
        assert!(err.to_string().contains("reserved address"));

        let err = ensure_public("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_default_fetcher_refuses_local_server() {
        let server = MockServer::start().await;
        let result = HttpFetcher::new().fetch(&server.uri(), None).await;
        assert!(matches!(result, Err(AppError::FatalFetch { status: None, .. })));
    }

    #[tokio::test]
    async fn test_fetch_success_sends_browser_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header_exists("user-agent"))
            .and(header_exists("accept-language"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>hi</h1>"))
            .mount(&server)
            .await;

        let url = format!("{}/page", server.uri());
        let page = fetcher().fetch(&url, None).await.unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.body, "<h1>hi</h1>");
        assert_eq!(page.url, url);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        for (route, status) in [("/gone", 404), ("/busy", 503), ("/slow-down", 429)] {
            Mock::given(path(route))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }
        let f = fetcher();

        let gone = f.fetch(&format!("{}/gone", server.uri()), None).await;
        assert!(matches!(gone, Err(AppError::FatalFetch { status: Some(404), .. })));

        let busy = f.fetch(&format!("{}/busy", server.uri()), None).await;
        assert!(matches!(busy, Err(AppError::TransientFetch { status: Some(503), .. })));

        let limited = f
            .fetch(&format!("{}/slow-down", server.uri()), None)
            .await
            .unwrap_err();
        assert!(limited.is_retryable());
        assert!(limited.implicates_proxy());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let uri = closed_port_url();

        let err = fetcher().fetch(&uri, None).await.unwrap_err();
        assert!(matches!(err, AppError::TransientFetch { status: None, .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(path("/stall"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let f = HttpFetcher::with_timeout(Duration::from_millis(200)).allow_private_urls();
        let err = f
            .fetch(&format!("{}/stall", server.uri()), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_fetch_bytes() {
        let server = MockServer::start().await;
        Mock::given(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let bytes = fetcher()
            .fetch_bytes(&format!("{}/a.png", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(bytes, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_get() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-type", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let check = fetcher().probe(&server.uri()).await.unwrap();
        assert!(check.accessible);
        assert_eq!(check.status_code, Some(200));
        assert_eq!(check.content_type.as_deref(), Some("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable() {
        let uri = closed_port_url();

        let check = fetcher().probe(&uri).await.unwrap();
        assert!(!check.accessible);
        assert!(check.status_code.is_none());
        assert!(check.error.is_some());
    }

    #[tokio::test]
    async fn test_login_session_cookie_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(body_string_contains("user=ada"))
            .and(body_string_contains("pass=secret"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(wiremock::matchers::header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&server)
            .await;

        let f = fetcher();
        let request = LoginRequest {
            url: format!("{}/login", server.uri()),
            username_field: "user".into(),
            password_field: "pass".into(),
            credential: Credential {
                username: "ada".into(),
                password: "secret".into(),
            },
        };
        assert!(f.login(&request, None).await.unwrap());

        let page = f
            .fetch(&format!("{}/private", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(page.body, "welcome");

        let fresh = f.new_session();
        let denied = fresh.fetch(&format!("{}/private", server.uri()), None).await;
        assert!(matches!(denied, Err(AppError::FatalFetch { status: Some(404), .. })));
    }

    #[tokio::test]
    async fn test_invalid_proxy_is_config_error() {
        let pool = gleaner_core::proxy_pool::ProxyPool::new(
            ["not a proxy url"],
            Default::default(),
        );
        let proxy = pool.next().unwrap();
        let result = fetcher().fetch("http://example.test/", proxy.as_ref()).await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
