//! Shared HTTP plumbing for the REST-backed adapters: URL building, status
//! mapping, rate-limit observation and request metrics.

use std::time::Instant;

use metrics::{counter, histogram};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};
use url::Url;

use super::rate_limit::{RateLimitInfo, RateLimitTracker, retry_after};
use super::trait_::{AdapterError, AdapterResult};
use crate::config::ProviderClientConfig;

/// Builds a header map from `(name, value)` pairs, marking values sensitive.
pub fn headers(pairs: &[(&'static str, String)]) -> AdapterResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let mut value = HeaderValue::from_str(value).map_err(|_| {
            AdapterError::configuration(format!("Invalid value for header {name}"))
        })?;
        value.set_sensitive(true);
        map.insert(HeaderName::from_static(name), value);
    }
    Ok(map)
}

pub struct ApiClient {
    provider: &'static str,
    client: reqwest::Client,
    base: Url,
    rate_limits: RateLimitTracker,
    rate_limit_prefixes: &'static [&'static str],
}

impl ApiClient {
    pub fn new(
        provider: &'static str,
        endpoint: &str,
        default_headers: HeaderMap,
        rate_limit_prefixes: &'static [&'static str],
        config: &ProviderClientConfig,
    ) -> AdapterResult<Self> {
        let base = Url::parse(endpoint.trim_end_matches('/')).map_err(|e| {
            AdapterError::configuration(format!("Invalid endpoint {endpoint}: {e}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(AdapterError::configuration(format!(
                "Invalid endpoint {endpoint}: not a base URL"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(default_headers)
            .build()
            .map_err(|e| AdapterError::configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            provider,
            client,
            base,
            rate_limits: RateLimitTracker::default(),
            rate_limit_prefixes,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Appends path segments to the endpoint. Each segment is percent-encoded
    /// on its own, so `group/project` stays a single segment (`group%2Fproject`).
    pub fn url<I, S>(&self, segments: I) -> AdapterResult<Url>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| AdapterError::configuration("Endpoint cannot be a base URL"))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment.as_ref());
            }
        }
        Ok(url)
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Sends without interpreting the status code.
    pub async fn send_raw(&self, request: RequestBuilder) -> AdapterResult<Response> {
        let started = Instant::now();
        let result = request.send().await;
        histogram!("provider_request_duration_seconds", "provider" => self.provider)
            .record(started.elapsed().as_secs_f64());

        let response = result.map_err(|err| {
            warn!(provider = self.provider, error = %err, "provider request failed");
            counter!("provider_request_errors_total", "provider" => self.provider, "status" => "network")
                .increment(1);
            AdapterError::from(err)
        })?;

        self.rate_limits
            .observe(response.headers(), self.rate_limit_prefixes);
        debug!(
            provider = self.provider,
            status = response.status().as_u16(),
            url = %response.url(),
            "provider response"
        );
        Ok(response)
    }

    /// Sends and converts any non-2xx status into an [`AdapterError`].
    pub async fn send(&self, request: RequestBuilder) -> AdapterResult<Response> {
        let response = self.send_raw(request).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.status_error(response).await)
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> AdapterResult<T> {
        let response = self.send(self.request(Method::GET, url)).await?;
        decode_json(response).await
    }

    pub async fn send_json<B, T>(&self, method: Method, url: Url, body: &B) -> AdapterResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(self.request(method, url).json(body)).await?;
        decode_json(response).await
    }

    pub async fn delete(&self, url: Url) -> AdapterResult<()> {
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_limits.snapshot()
    }

    async fn status_error(&self, response: Response) -> AdapterError {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        counter!(
            "provider_request_errors_total",
            "provider" => self.provider,
            "status" => status.as_u16().to_string()
        )
        .increment(1);

        let parsed: Option<JsonValue> = serde_json::from_str(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(backend_message)
            .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));
        let details = json!({
            "status": status.as_u16(),
            "body": parsed.unwrap_or(JsonValue::String(body)),
        });

        let error = match status {
            StatusCode::UNAUTHORIZED => AdapterError::unauthorized(message),
            StatusCode::FORBIDDEN => {
                let exhausted = self
                    .rate_limit()
                    .is_some_and(|info| info.remaining == 0);
                if exhausted {
                    let wait = self.rate_limit().map(|info| {
                        (info.reset - chrono::Utc::now()).num_seconds().max(0) as u64
                    });
                    warn!(provider = self.provider, "rate limit exhausted");
                    AdapterError::rate_limited(wait, message)
                } else {
                    AdapterError::http(403, message)
                }
            }
            StatusCode::NOT_FOUND => AdapterError::not_found(message),
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = retry_after(&headers);
                warn!(provider = self.provider, retry_after = ?wait, "rate limited");
                AdapterError::rate_limited(wait, message)
            }
            other => {
                if other.is_server_error() {
                    warn!(provider = self.provider, status = other.as_u16(), "provider server error");
                }
                AdapterError::http(other.as_u16(), message)
            }
        };
        error.with_details(details)
    }
}

pub async fn decode_json<T: DeserializeOwned>(response: Response) -> AdapterResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AdapterError::malformed(format!("Invalid response body: {e}")))
}

fn backend_message(body: &JsonValue) -> Option<String> {
    ["message", "error", "error_description"]
        .iter()
        .find_map(|key| body.get(*key).and_then(JsonValue::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::trait_::AdapterErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: &str) -> ApiClient {
        ApiClient::new(
            "test",
            endpoint,
            HeaderMap::new(),
            &["x-ratelimit-"],
            &ProviderClientConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn encodes_nested_namespace_as_one_segment() {
        let api = client("https://gitlab.example.com/api/v4/");
        let url = api.url(["projects", "group/sub/project"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab.example.com/api/v4/projects/group%2Fsub%2Fproject"
        );
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let err = ApiClient::new(
            "test",
            "not a url",
            HeaderMap::new(),
            &[],
            &ProviderClientConfig::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind, AdapterErrorKind::Configuration);
    }

    #[tokio::test]
    async fn maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = client(&server.uri());

        let err = api
            .get_json::<JsonValue>(api.url(["missing"]).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::NotFound);
        assert_eq!(err.message, "Not Found");

        let err = api
            .get_json::<JsonValue>(api.url(["busy"]).unwrap())
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            AdapterErrorKind::RateLimited {
                retry_after_secs: Some(17)
            }
        );

        let err = api
            .get_json::<JsonValue>(api.url(["broken"]).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.message, "Request failed with status 503");
    }

    #[tokio::test]
    async fn forbidden_with_empty_quota_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-limit", "60")
                    .insert_header("x-ratelimit-reset", "4102444800")
                    .set_body_json(json!({"message": "API rate limit exceeded"})),
            )
            .mount(&server)
            .await;

        let api = client(&server.uri());
        let err = api
            .get_json::<JsonValue>(api.url(["user"]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err.kind, AdapterErrorKind::RateLimited { .. }));
        assert_eq!(api.rate_limit().unwrap().limit, 60);
    }
}
