//! Rate-limited HTTP transport.
//!
//! Single chokepoint for every outbound call: one process-wide token
//! bucket with jitter, user-agent rotation shared across tasks, session
//! cookie injection, and retry with exponential backoff. Callers never
//! touch `reqwest` directly.

use std::num::NonZeroU32;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use rand::Rng;
use reqwest::header::{COOKIE, RANGE, REFERER, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::session::Credential;

/// Process-wide rate limiter type.
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Longest delay the transport will honor from a Retry-After header.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Service-level status codes in the response envelope.
const CODE_OK: i64 = 0;
const CODE_AUTH_EXPIRED: i64 = -101;
const CODE_RATE_LIMITED: i64 = -412;
const CODE_REQUEST_BLOCKED: i64 = -799;
const CODE_NOT_FOUND: i64 = -404;
const CODE_ITEM_INVISIBLE: i64 = 62002;
const CODE_ITEM_AUDITING: i64 = 62004;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Minimum delay between any two outbound requests.
    pub request_interval: Duration,
    /// Upper bound of the uniform jitter added on top of the interval.
    pub random_offset: Duration,
    /// Retry attempts beyond the first (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub retry_base_interval: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User-agent strings rotated across requests.
    pub user_agents: Vec<String>,
    /// Rotate the user agent after this much time.
    pub ua_rotate_interval: Duration,
    /// Rotate the user agent after this many requests, when set.
    pub ua_rotate_requests: Option<u64>,
    /// Referer header sent with every request.
    pub referer: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_millis(1500),
            random_offset: Duration::from_millis(500),
            max_retries: 3,
            retry_base_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            ],
            ua_rotate_interval: Duration::from_secs(300),
            ua_rotate_requests: None,
            referer: "https://www.bilibili.com".to_string(),
        }
    }
}

/// User-agent rotation cursor, shared across all concurrent callers.
#[derive(Debug)]
struct UaRotation {
    index: usize,
    rotated_at: Instant,
    requests_since_rotation: u64,
}

/// The rate-limited HTTP transport.
pub struct Transport {
    http: reqwest::Client,
    limiter: GlobalRateLimiter,
    jitter: Option<Jitter>,
    ua: Mutex<UaRotation>,
    credential: RwLock<Option<Credential>>,
    config: TransportConfig,
}

impl Transport {
    /// Build a transport from config.
    pub fn new(config: TransportConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .gzip(true)
            .build()
            .map_err(ClientError::from)?;

        // A zero interval would make the quota degenerate; one request per
        // millisecond is effectively unlimited for this workload.
        let period = if config.request_interval.is_zero() {
            Duration::from_millis(1)
        } else {
            config.request_interval
        };
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);

        let jitter = if config.random_offset.is_zero() {
            None
        } else {
            Some(Jitter::up_to(config.random_offset))
        };

        Ok(Self {
            http,
            limiter: RateLimiter::direct(quota),
            jitter,
            ua: Mutex::new(UaRotation {
                index: 0,
                rotated_at: Instant::now(),
                requests_since_rotation: 0,
            }),
            credential: RwLock::new(None),
            config,
        })
    }

    /// Install the session credential injected into every request.
    pub fn set_credential(&self, credential: Option<Credential>) {
        if let Ok(mut guard) = self.credential.write() {
            *guard = credential;
        }
    }

    /// Current session credential, if any.
    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().ok().and_then(|c| c.clone())
    }

    /// Issue a JSON request and decode the service envelope.
    ///
    /// Retries `Transient` and `RateLimited` failures up to
    /// `max_retries` times with exponential backoff; `AuthExpired` is
    /// surfaced immediately so the session manager can re-authenticate.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> ClientResult<T> {
        let max_attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            self.throttle().await;

            match self.send_once(method.clone(), url, query, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry_delay(attempt, e.retry_after());
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "request failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ClientError::transient("retry budget exhausted")))
    }

    /// Fetch a byte stream, optionally resuming from a prior offset via a
    /// Range request. Shares the limiter, user agent and session state with
    /// [`Transport::request`]; retries belong to the caller, which owns the
    /// partially written file.
    pub async fn stream_get(
        &self,
        url: &str,
        resume_from: Option<u64>,
    ) -> ClientResult<reqwest::Response> {
        self.throttle().await;

        let mut req = self.base_request(Method::GET, url);
        if let Some(offset) = resume_from.filter(|&o| o > 0) {
            req = req.header(RANGE, format!("bytes={offset}-"));
        }
        let response = req.send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(response),
            StatusCode::TOO_MANY_REQUESTS => Err(ClientError::RateLimited {
                retry_after: parse_retry_after(&response),
            }),
            status if status.is_server_error() => {
                Err(ClientError::transient(format!("upstream status {status}")))
            }
            status => Err(ClientError::remote(
                status.as_u16() as i64,
                format!("unexpected status for byte range fetch: {status}"),
            )),
        }
    }

    /// Advertised total byte length of a resource, when the server sends one.
    pub async fn content_length(&self, url: &str) -> ClientResult<Option<u64>> {
        self.throttle().await;

        let response = self.base_request(Method::HEAD, url).send().await?;
        if response.status().is_success() {
            Ok(response.content_length())
        } else if response.status().is_server_error() {
            Err(ClientError::transient(format!(
                "HEAD failed with {}",
                response.status()
            )))
        } else {
            // Some CDN hosts reject HEAD; the downloader falls back to the
            // length advertised on the GET itself.
            Ok(None)
        }
    }

    /// Wait for a rate-limiter slot, with jitter when configured.
    async fn throttle(&self) {
        match self.jitter {
            Some(jitter) => self.limiter.until_ready_with_jitter(jitter).await,
            None => self.limiter.until_ready().await,
        }
    }

    fn base_request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.current_user_agent())
            .header(REFERER, &self.config.referer);
        if let Some(credential) = self.credential() {
            let cookie = credential.cookie_header();
            if !cookie.is_empty() {
                req = req.header(COOKIE, cookie);
            }
        }
        req
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> ClientResult<T> {
        let mut req = self.base_request(method, url).query(query);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ClientError::RateLimited {
                    retry_after: parse_retry_after(&response),
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ClientError::AuthExpired);
            }
            StatusCode::NOT_FOUND => return Err(ClientError::NotFound),
            status if status.is_server_error() => {
                return Err(ClientError::transient(format!("upstream status {status}")));
            }
            status if !status.is_success() => {
                let text = response.text().await.unwrap_or_default();
                return Err(ClientError::remote(
                    status.as_u16() as i64,
                    truncate(&text, 200),
                ));
            }
            _ => {}
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ClientError::invalid_response(e.to_string()))?;
        debug!(url, code = envelope.code, "response envelope decoded");

        match envelope.code {
            CODE_OK => envelope
                .data
                .ok_or_else(|| ClientError::invalid_response("envelope has no data field")),
            code => Err(map_service_code(code, envelope.message)),
        }
    }

    /// Backoff delay before the next attempt:
    /// `base * 2^(attempt-1) + uniform jitter`, or the server-requested
    /// delay clamped to `[base, 60s]`.
    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.config.retry_base_interval.min(MAX_RETRY_AFTER);
        if let Some(after) = retry_after {
            return after.clamp(base, MAX_RETRY_AFTER);
        }
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = if self.config.random_offset.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.random_offset.as_millis() as u64)
        };
        exp + Duration::from_millis(jitter_ms)
    }

    fn current_user_agent(&self) -> String {
        let agents = &self.config.user_agents;
        if agents.is_empty() {
            return TransportConfig::default().user_agents[0].clone();
        }
        let Ok(mut rotation) = self.ua.lock() else {
            return agents[0].clone();
        };
        rotation.requests_since_rotation += 1;

        let time_up = rotation.rotated_at.elapsed() >= self.config.ua_rotate_interval;
        let count_up = self
            .config
            .ua_rotate_requests
            .is_some_and(|n| rotation.requests_since_rotation >= n);
        if time_up || count_up {
            rotation.index = (rotation.index + 1) % agents.len();
            rotation.rotated_at = Instant::now();
            rotation.requests_since_rotation = 0;
            debug!(index = rotation.index, "rotated user agent");
        }
        agents[rotation.index].clone()
    }
}

/// Standard response envelope of the remote service.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<T>,
}

/// Map a non-zero service envelope code to an error kind.
fn map_service_code(code: i64, message: String) -> ClientError {
    match code {
        CODE_AUTH_EXPIRED => ClientError::AuthExpired,
        CODE_RATE_LIMITED | CODE_REQUEST_BLOCKED => {
            ClientError::RateLimited { retry_after: None }
        }
        CODE_NOT_FOUND | CODE_ITEM_INVISIBLE | CODE_ITEM_AUDITING => ClientError::NotFound,
        code => ClientError::remote(code, message),
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_with(base_ms: u64, offset_ms: u64) -> Transport {
        Transport::new(TransportConfig {
            retry_base_interval: Duration::from_millis(base_ms),
            random_offset: Duration::from_millis(offset_ms),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_map_service_code() {
        assert!(matches!(
            map_service_code(CODE_AUTH_EXPIRED, String::new()),
            ClientError::AuthExpired
        ));
        assert!(matches!(
            map_service_code(CODE_RATE_LIMITED, String::new()),
            ClientError::RateLimited { .. }
        ));
        assert!(matches!(
            map_service_code(CODE_ITEM_INVISIBLE, String::new()),
            ClientError::NotFound
        ));
        assert!(matches!(
            map_service_code(7, "weird".to_string()),
            ClientError::Remote { code: 7, .. }
        ));
    }

    #[test]
    fn test_retry_delay_doubles_per_attempt() {
        let transport = transport_with(100, 0);
        assert_eq!(transport.retry_delay(1, None), Duration::from_millis(100));
        assert_eq!(transport.retry_delay(2, None), Duration::from_millis(200));
        assert_eq!(transport.retry_delay(3, None), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_delay_adds_bounded_jitter() {
        let transport = transport_with(100, 50);
        for _ in 0..20 {
            let d = transport.retry_delay(1, None);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retry_after_clamped() {
        let transport = transport_with(2000, 0);
        // Below the base interval: raised to it.
        assert_eq!(
            transport.retry_delay(1, Some(Duration::from_millis(10))),
            Duration::from_millis(2000)
        );
        // Above the 60s cap: clamped down.
        assert_eq!(
            transport.retry_delay(1, Some(Duration::from_secs(600))),
            MAX_RETRY_AFTER
        );
        // In between: honored as-is.
        assert_eq!(
            transport.retry_delay(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_ua_rotation_by_request_count() {
        let transport = Transport::new(TransportConfig {
            user_agents: vec!["ua-a".to_string(), "ua-b".to_string()],
            ua_rotate_interval: Duration::from_secs(3600),
            ua_rotate_requests: Some(2),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(transport.current_user_agent(), "ua-a");
        // Second request trips the rotation threshold.
        assert_eq!(transport.current_user_agent(), "ua-b");
        assert_eq!(transport.current_user_agent(), "ua-b");
        assert_eq!(transport.current_user_agent(), "ua-a");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo wörld, this is a long message";
        let cut = truncate(text, 6);
        assert!(cut.len() <= 6 + '…'.len_utf8());
    }

    #[test]
    fn test_envelope_decodes_missing_data() {
        let envelope: Envelope<serde_json::Value> =
            serde_json::from_str(r#"{"code": -101, "message": "not logged in"}"#).unwrap();
        assert_eq!(envelope.code, -101);
        assert!(envelope.data.is_none());
    }
}
