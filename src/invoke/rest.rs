//! REST action invoker and request signing.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Url};
use tracing::{debug, warn};

use crate::errors::{Result, SchedulerError};
use crate::model::AuthMethod;

use super::{ActionInvoker, AuthInjector, SecretProvider};

/// HTTP methods an action is allowed to use.
const ALLOWED_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

pub struct RestInvoker {
    client: Client,
    url: Url,
    method: Method,
    content_type: String,
    payload: Vec<u8>,
    injector: Arc<dyn AuthInjector>,
}

impl RestInvoker {
    /// Validate address and method up front; both are contract errors when
    /// malformed so validation catches them before anything is scheduled.
    pub fn build(
        client: Client,
        address: &str,
        method: &str,
        content_type: &str,
        payload: Vec<u8>,
        injector: Arc<dyn AuthInjector>,
    ) -> Result<Self> {
        let parsed = method
            .to_ascii_uppercase()
            .parse::<Method>()
            .ok()
            .filter(|m| ALLOWED_METHODS.contains(m))
            .ok_or_else(|| {
                SchedulerError::ContractInvalid(format!("HTTP method '{method}' is not allowed"))
            })?;
        let method = parsed;

        let url = Url::parse(address).map_err(|e| {
            SchedulerError::ContractInvalid(format!("invalid action address '{address}': {e}"))
        })?;

        Ok(RestInvoker {
            client,
            url,
            method,
            content_type: content_type.to_string(),
            payload,
            injector,
        })
    }
}

#[async_trait]
impl ActionInvoker for RestInvoker {
    async fn invoke(&self, correlation_id: &str) -> anyhow::Result<String> {
        let mut req = self
            .client
            .request(self.method.clone(), self.url.clone())
            .header(CONTENT_TYPE, &self.content_type)
            .header("X-Correlation-ID", correlation_id);
        if !self.payload.is_empty() {
            req = req.body(self.payload.clone());
        }
        req = self.injector.inject(req);

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("REST action to {} returned {status}: {body}", self.url);
        }

        debug!(url = %self.url, %status, correlation_id, "REST action completed");
        Ok(body)
    }
}

/// Injector that leaves the request untouched.
pub struct NoopInjector;

impl AuthInjector for NoopInjector {
    fn inject(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req
    }
}

/// Bearer-token injector.
pub struct JwtInjector {
    token: String,
}

impl AuthInjector for JwtInjector {
    fn inject(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }
}

/// Secret provider backed by a token file on disk (the platform secret
/// store mounts tokens as files). A missing or unreadable token degrades to
/// the no-op injector with a warning; the action still fires unsigned.
pub struct FileTokenProvider {
    token_path: Option<PathBuf>,
}

impl FileTokenProvider {
    pub fn new(token_path: Option<PathBuf>) -> Self {
        FileTokenProvider { token_path }
    }
}

impl SecretProvider for FileTokenProvider {
    fn injector(&self, method: AuthMethod) -> Arc<dyn AuthInjector> {
        match method {
            AuthMethod::None => Arc::new(NoopInjector),
            AuthMethod::Jwt => {
                let Some(path) = &self.token_path else {
                    warn!("JWT auth requested but no token path is configured");
                    return Arc::new(NoopInjector);
                };
                match std::fs::read_to_string(path) {
                    Ok(token) => Arc::new(JwtInjector {
                        token: token.trim().to_string(),
                    }),
                    Err(e) => {
                        warn!(path = %path.display(), "failed to read JWT token: {e}");
                        Arc::new(NoopInjector)
                    }
                }
            }
        }
    }
}
