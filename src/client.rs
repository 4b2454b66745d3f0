//! HTTP client with response assertions.
//!
//! Every assertion comes in two flavors: `check_*` returns an
//! [`AssertionFailure`], `assert_*` panics with it at the caller's location.

use crate::error::StubError;
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Client settings. Nothing else is retained between requests.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Headers sent with every request
    pub default_headers: Vec<(String, String)>,
    pub timeout: Duration,
    /// Append `; charset=UTF-8` to a Content-Type without a charset
    pub append_default_charset: bool,
    /// Log every response
    pub log_responses: bool,
    /// Pretty-print JSON bodies in logs
    pub pretty_print: bool,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: Vec::new(),
            timeout: Duration::from_secs(10),
            append_default_charset: false,
            log_responses: false,
            pretty_print: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn append_default_charset(mut self, append: bool) -> Self {
        self.append_default_charset = append;
        self
    }

    pub fn log_responses(mut self, log: bool) -> Self {
        self.log_responses = log;
        self
    }

    pub fn pretty_print(mut self, pretty: bool) -> Self {
        self.pretty_print = pretty;
        self
    }
}

/// Thin request wrapper around `reqwest`.
#[derive(Debug, Clone)]
pub struct StubClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl StubClient {
    pub fn new(config: ClientConfig) -> Result<Self, StubError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn get(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<ClientResponse, StubError> {
        self.request("GET", path, headers).await
    }

    pub async fn post(
        &self,
        path: &str,
        headers: &[(&str, &str)],
        body: impl Into<Vec<u8>>,
    ) -> Result<ClientResponse, StubError> {
        self.send("POST", path, headers, Some(body.into())).await
    }

    /// Send a request without a body.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<ClientResponse, StubError> {
        self.send(method, path, headers, None).await
    }

    /// Send a request. `path` may be absolute or relative to the base URL.
    pub async fn send(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<ClientResponse, StubError> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| StubError::InvalidRequest(format!("invalid method {:?}", method)))?;
        let url = self.resolve(path);

        let mut builder = self.http.request(method.clone(), &url);
        let defaults = self
            .config
            .default_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()));
        for (name, value) in defaults.chain(headers.iter().copied()) {
            builder = builder.header(name, self.header_value(name, value).as_ref());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let mut response_headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            response_headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        let body = response.bytes().await?.to_vec();

        let response = ClientResponse {
            status,
            headers: response_headers,
            body,
        };
        if self.config.log_responses {
            info!(
                method = %method,
                url = %url,
                status,
                body = %response.log_body(self.config.pretty_print),
                "Received response"
            );
        }
        Ok(response)
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    fn header_value<'a>(&self, name: &str, value: &'a str) -> Cow<'a, str> {
        if self.config.append_default_charset
            && name.eq_ignore_ascii_case("content-type")
            && !value.to_ascii_lowercase().contains("charset")
        {
            Cow::Owned(format!("{}; charset=UTF-8", value))
        } else {
            Cow::Borrowed(value)
        }
    }
}

/// Content types recognized by [`ClientResponse::assert_content_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Json,
    Xml,
    Html,
    Binary,
}

impl ContentType {
    /// Whether a Content-Type header value belongs to this type.
    pub fn matches(&self, header: &str) -> bool {
        let media = header
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match self {
            ContentType::Text => media == "text/plain",
            ContentType::Json => {
                matches!(media.as_str(), "application/json" | "application/javascript" | "text/javascript")
                    || media.ends_with("+json")
            }
            ContentType::Xml => {
                matches!(media.as_str(), "application/xml" | "text/xml") || media.ends_with("+xml")
            }
            ContentType::Html => media == "text/html",
            ContentType::Binary => media == "application/octet-stream",
        }
    }
}

/// A failed response assertion.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{what}\n  expected: {expected}\n    actual: {actual}")]
pub struct AssertionFailure {
    pub what: String,
    pub expected: String,
    pub actual: String,
}

impl AssertionFailure {
    fn new(what: impl Into<String>, expected: impl ToString, actual: impl ToString) -> Self {
        Self {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    status: u16,
    /// Keyed by lower-cased header name
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ClientResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    fn log_body(&self, pretty: bool) -> String {
        match self.json() {
            Ok(json) if pretty => serde_json::to_string_pretty(&json).unwrap_or_default(),
            _ => self.text().into_owned(),
        }
    }

    fn select(&self, path: &str) -> Result<Vec<serde_json::Value>, AssertionFailure> {
        let json = self.json().map_err(|e| {
            AssertionFailure::new(format!("JSON path {}", path), "a JSON body", e)
        })?;
        crate::json_path::select(&json, path)
            .map_err(|e| AssertionFailure::new(format!("JSON path {}", path), "a valid path", e))
    }

    pub fn check_status(&self, expected: u16) -> Result<(), AssertionFailure> {
        if self.status == expected {
            Ok(())
        } else {
            Err(AssertionFailure::new("status code", expected, self.status))
        }
    }

    pub fn check_header(&self, name: &str, expected: &str) -> Result<(), AssertionFailure> {
        match self.header(name) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(AssertionFailure::new(format!("header {}", name), expected, actual)),
            None => Err(AssertionFailure::new(format!("header {}", name), expected, "<absent>")),
        }
    }

    pub fn check_header_present(&self, name: &str) -> Result<(), AssertionFailure> {
        if self.header(name).is_some() {
            Ok(())
        } else {
            Err(AssertionFailure::new(format!("header {}", name), "<present>", "<absent>"))
        }
    }

    pub fn check_content_type(&self, expected: ContentType) -> Result<(), AssertionFailure> {
        let actual = self.header("content-type").unwrap_or("<absent>");
        if expected.matches(actual) {
            Ok(())
        } else {
            Err(AssertionFailure::new("content type", format!("{:?}", expected), actual))
        }
    }

    pub fn check_body_equals(&self, expected: &str) -> Result<(), AssertionFailure> {
        let actual = self.text();
        if actual == expected {
            Ok(())
        } else {
            Err(AssertionFailure::new("body", expected, actual))
        }
    }

    pub fn check_body_contains(&self, expected: &str) -> Result<(), AssertionFailure> {
        let actual = self.text();
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(AssertionFailure::new(
                "body",
                format!("a string containing {:?}", expected),
                actual,
            ))
        }
    }

    /// A path selecting one value compares that value; otherwise the list
    /// of selected values is compared.
    pub fn check_json_path(
        &self,
        path: &str,
        expected: impl Into<serde_json::Value>,
    ) -> Result<(), AssertionFailure> {
        let expected = expected.into();
        let mut values = self.select(path)?;
        let actual = if values.len() == 1 {
            values.remove(0)
        } else {
            serde_json::Value::Array(values)
        };
        if actual == expected {
            Ok(())
        } else {
            Err(AssertionFailure::new(format!("JSON path {}", path), expected, actual))
        }
    }

    /// Every expected item appears among the selected values.
    pub fn check_json_path_has_items(
        &self,
        path: &str,
        items: &[serde_json::Value],
    ) -> Result<(), AssertionFailure> {
        let mut values = self.select(path)?;
        // A path selecting a single array is checked element-wise.
        let flattened = match values.as_slice() {
            [serde_json::Value::Array(inner)] => Some(inner.clone()),
            _ => None,
        };
        if let Some(inner) = flattened {
            values = inner;
        }
        if items.iter().all(|item| values.contains(item)) {
            Ok(())
        } else {
            Err(AssertionFailure::new(
                format!("JSON path {}", path),
                format!("items {}", serde_json::Value::Array(items.to_vec())),
                serde_json::Value::Array(values),
            ))
        }
    }

    #[track_caller]
    pub fn assert_status(&self, expected: u16) -> &Self {
        fail_on(self.check_status(expected));
        self
    }

    #[track_caller]
    pub fn assert_header(&self, name: &str, expected: &str) -> &Self {
        fail_on(self.check_header(name, expected));
        self
    }

    #[track_caller]
    pub fn assert_header_present(&self, name: &str) -> &Self {
        fail_on(self.check_header_present(name));
        self
    }

    #[track_caller]
    pub fn assert_content_type(&self, expected: ContentType) -> &Self {
        fail_on(self.check_content_type(expected));
        self
    }

    #[track_caller]
    pub fn assert_body_equals(&self, expected: &str) -> &Self {
        fail_on(self.check_body_equals(expected));
        self
    }

    #[track_caller]
    pub fn assert_body_contains(&self, expected: &str) -> &Self {
        fail_on(self.check_body_contains(expected));
        self
    }

    #[track_caller]
    pub fn assert_json_path(&self, path: &str, expected: impl Into<serde_json::Value>) -> &Self {
        fail_on(self.check_json_path(path, expected));
        self
    }

    #[track_caller]
    pub fn assert_json_path_has_items(&self, path: &str, items: &[serde_json::Value]) -> &Self {
        fail_on(self.check_json_path_has_items(path, items));
        self
    }
}

#[track_caller]
fn fail_on(result: Result<(), AssertionFailure>) {
    if let Err(failure) = result {
        panic!("assertion failed: {}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> ClientResponse {
        ClientResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn lotto() -> ClientResponse {
        response(
            200,
            &[("Content-Type", "application/json")],
            r#"{"lotto":{"lottoId":5,"winners":[{"winnerId":23},{"winnerId":54}]}}"#,
        )
    }

    #[test]
    fn test_status_and_headers() {
        let r = response(200, &[("Matched-Stub-Name", "mock_demo_1")], "");
        assert!(r.check_status(200).is_ok());
        assert_eq!(
            r.check_status(404).unwrap_err(),
            AssertionFailure::new("status code", 404, 200)
        );
        assert!(r.check_header("matched-stub-name", "mock_demo_1").is_ok());
        assert!(r.check_header("Matched-Stub-Name", "other").is_err());
        assert!(r.check_header_present("Matched-Stub-Name").is_ok());
        assert!(r.check_header_present("X-Missing").is_err());
    }

    #[test]
    fn test_content_type() {
        assert!(ContentType::Text.matches("text/plain; charset=UTF-8"));
        assert!(ContentType::Json.matches("application/problem+json"));
        assert!(!ContentType::Json.matches("text/plain"));
        assert!(ContentType::Xml.matches("text/xml"));

        let r = response(200, &[("Content-Type", "text/plain")], "Hello world!");
        r.assert_content_type(ContentType::Text)
            .assert_body_contains("Hello")
            .assert_body_equals("Hello world!");
        assert!(r.check_content_type(ContentType::Html).is_err());
    }

    #[test]
    fn test_json_paths() {
        let r = lotto();
        assert!(r.check_json_path("lotto.lottoId", 5).is_ok());
        assert!(r.check_json_path("$.lotto.lottoId", 6).is_err());
        assert!(r
            .check_json_path_has_items(
                "$.lotto.winners[*].winnerId",
                &[serde_json::json!(23), serde_json::json!(54)]
            )
            .is_ok());
        assert!(r
            .check_json_path_has_items("$.lotto.winners[*].winnerId", &[serde_json::json!(99)])
            .is_err());
    }

    #[test]
    fn test_dotted_path_through_array() {
        let r = lotto();
        r.assert_json_path_has_items(
            "lotto.winners.winnerId",
            &[serde_json::json!(23), serde_json::json!(54)],
        )
        .assert_json_path("lotto.winners.winnerId", serde_json::json!([23, 54]));
        assert!(r
            .check_json_path_has_items("lotto.winners.winnerId", &[serde_json::json!(99)])
            .is_err());
    }

    #[test]
    fn test_json_path_on_text_body_fails() {
        let r = response(200, &[], "not json");
        assert!(r.check_json_path("name", "John").is_err());
    }

    #[test]
    #[should_panic(expected = "status code")]
    fn test_assert_status_panics() {
        response(500, &[], "").assert_status(200);
    }

    #[test]
    fn test_url_resolution_and_charset() {
        let client = StubClient::new(
            ClientConfig::new("http://127.0.0.1:8080/").append_default_charset(true),
        )
        .unwrap();
        assert_eq!(client.resolve("/mock/demo/1"), "http://127.0.0.1:8080/mock/demo/1");
        assert_eq!(client.resolve("mock"), "http://127.0.0.1:8080/mock");
        assert_eq!(client.resolve("http://other/x"), "http://other/x");

        assert_eq!(
            client.header_value("Content-Type", "text/plain"),
            "text/plain; charset=UTF-8"
        );
        assert_eq!(
            client.header_value("Content-Type", "text/plain; charset=ISO-8859-1"),
            "text/plain; charset=ISO-8859-1"
        );
        assert_eq!(client.header_value("Accept", "text/plain"), "text/plain");
    }
}
