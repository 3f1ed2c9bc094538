use crate::error::{Error, Result};
use base64::Engine;
use rand::Rng;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// 環境変数名
pub const ENV_API_URL: &str = "JIRA_API_URL";
pub const ENV_API_USER: &str = "JIRA_API_USER";
pub const ENV_API_TOKEN: &str = "JIRA_API_TOKEN";

const API_PREFIX: &str = "/rest/api/3";
const ERROR_BODY_PREFIX_CHARS: usize = 800;

/// Basic認証の資格情報（username:token）
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub api_token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            api_token: api_token.into(),
        }
    }

    /// `Authorization` ヘッダーの値
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.api_token);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
        )
    }
}

/// ランダム待機時間の範囲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub min: Duration,
    pub max: Duration,
}

impl Jitter {
    pub const fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    pub const fn none() -> Self {
        Self::from_millis(0, 0)
    }

    /// 範囲内の待機時間を1つ選ぶ
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// リクエストごとの待機・リトライ・タイムアウト設定
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPolicy {
    /// 各リクエスト前のジッター
    pub request_jitter: Jitter,
    /// 検索ページ間のジッター
    pub page_jitter: Jitter,
    /// 429を受けた後、1回だけ再試行するまでの待機時間
    pub rate_limit_cooldown: Duration,
    /// 1リクエストあたりのタイムアウト
    pub timeout: Duration,
}

impl RequestPolicy {
    pub fn new() -> Self {
        Self {
            request_jitter: Jitter::from_millis(200, 800),
            page_jitter: Jitter::from_millis(200, 700),
            rate_limit_cooldown: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
        }
    }

    /// 待機なしのポリシー（テストやローカルのモックサーバー向け）
    pub fn immediate() -> Self {
        Self {
            request_jitter: Jitter::none(),
            page_jitter: Jitter::none(),
            rate_limit_cooldown: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn request_jitter(mut self, jitter: Jitter) -> Self {
        self.request_jitter = jitter;
        self
    }

    pub fn page_jitter(mut self, jitter: Jitter) -> Self {
        self.page_jitter = jitter;
        self
    }

    pub fn rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct JiraConfig {
    /// サイトのルートURL（例: https://example.atlassian.net）
    pub base_url: String,
    pub credentials: Credentials,
    pub policy: RequestPolicy,
}

impl JiraConfig {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let base_url = normalize_base_url(&base_url.into());

        Url::parse(&base_url)
            .map_err(|_| Error::InvalidConfiguration("Invalid base URL".to_string()))?;

        Ok(Self {
            base_url,
            credentials,
            policy: RequestPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_with_overrides(None, None, None)
    }

    /// 引数で渡された値を優先し、残りを環境変数から補う
    pub fn from_env_with_overrides(
        url: Option<String>,
        username: Option<String>,
        api_token: Option<String>,
    ) -> Result<Self> {
        resolve_with(url, username, api_token, |name| std::env::var(name).ok())
    }
}

fn resolve_with(
    url: Option<String>,
    username: Option<String>,
    api_token: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<JiraConfig> {
    let pick = |value: Option<String>, name: &str| {
        value
            .filter(|v| !v.trim().is_empty())
            .or_else(|| lookup(name).filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| Error::ConfigurationMissing(format!("{} is not set", name)))
    };

    let base_url = pick(url, ENV_API_URL)?;
    let username = pick(username, ENV_API_USER)?;
    let api_token = pick(api_token, ENV_API_TOKEN)?;

    JiraConfig::new(base_url, Credentials::new(username, api_token))
}

/// 末尾の `/` と `/rest/api/3` を取り除く
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    trimmed
        .strip_suffix(API_PREFIX)
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .to_string()
}

/// HTTPアダプターの応答。失敗はすべて `Empty` に縮退する
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    Json(Value),
    Empty,
}

impl RawResponse {
    pub fn is_empty(&self) -> bool {
        matches!(self, RawResponse::Empty)
    }

    pub fn json(&self) -> Option<&Value> {
        match self {
            RawResponse::Json(value) => Some(value),
            RawResponse::Empty => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            RawResponse::Json(value) => Some(value),
            RawResponse::Empty => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JiraClient {
    pub(crate) client: Client,
    pub(crate) config: Arc<JiraConfig>,
}

impl JiraClient {
    pub fn new(config: JiraConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&config.credentials.header_value())
                .map_err(|_| Error::InvalidConfiguration("Invalid auth header".to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.policy.timeout)
            .build()
            .map_err(|e| {
                Error::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &JiraConfig {
        &self.config
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.config.policy
    }

    /// 認証付きGETを発行する。
    ///
    /// 送信前にジッター分だけ待機し、429なら一定時間待って1回だけ再試行する。
    /// それ以外の失敗（非2xx、通信エラー、タイムアウト、JSON不正）はログに残して
    /// `RawResponse::Empty` を返す。呼び出し側へエラーは伝播しない。
    pub async fn request(&self, endpoint: &str, query: &[(&str, String)]) -> RawResponse {
        match self.try_request(endpoint, query).await {
            Ok(value) => RawResponse::Json(value),
            Err(e) => {
                warn!(endpoint, error = %e, "request failed, continuing with empty result");
                RawResponse::Empty
            }
        }
    }

    pub(crate) async fn try_request(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        self.config.policy.request_jitter.wait().await;

        let url = format!("{}{}", self.config.base_url, endpoint);
        debug!(%url, "GET");

        let mut response = self.client.get(&url).query(query).send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let cooldown = self.config.policy.rate_limit_cooldown;
            warn!(
                endpoint,
                cooldown_ms = cooldown.as_millis() as u64,
                "rate limited, waiting before a single retry"
            );
            tokio::time::sleep(cooldown).await;

            response = self.client.get(&url).query(query).send().await?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::RateLimitExceeded);
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::ApiError {
                status: status.as_u16(),
                message: body.chars().take(ERROR_BODY_PREFIX_CHARS).collect(),
            });
        }

        let data = response.json::<Value>().await?;
        Ok(data)
    }
}
