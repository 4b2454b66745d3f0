//! Configuration for the stub server.
//!
//! Defines server options, request patterns and scripted responses. Stub
//! definitions can be registered in-process or loaded from a YAML file.

use crate::error::StubError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Top-level configuration file for the stub server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StubServerConfig {
    /// Listener and logging options
    #[serde(default)]
    pub server: ServerOptions,

    /// Stubs registered at startup
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Response served when no stub matches (404 diagnostic when unset)
    #[serde(default)]
    pub default_response: Option<ResponseDefinition>,
}

impl StubServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, StubError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), StubError> {
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| StubError::malformed(format!("stub {}: {}", i, e)))?;
        }
        if let Some(default) = &self.default_response {
            default.validate()?;
        }
        Ok(())
    }
}

/// Listener and notifier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOptions {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind (0 = pick a free port)
    #[serde(default)]
    pub port: u16,

    /// Log every received request with its headers
    #[serde(default)]
    pub verbose: bool,

    /// Log matched stubs
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type used when neither the stub headers nor the body kind set one
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            verbose: false,
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

impl ServerOptions {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Enable or disable the per-request console notifier.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// A single stub definition: request pattern plus scripted response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Optional name, echoed back in the `Matched-Stub-Name` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Request pattern
    pub request: RequestPattern,

    /// Response to return
    #[serde(default)]
    pub response: ResponseDefinition,

    /// Priority (higher = preferred over more specific stubs)
    #[serde(default)]
    pub priority: i32,
}

impl StubDefinition {
    /// Validate the stub definition.
    pub fn validate(&self) -> Result<(), StubError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(StubError::malformed("stub name cannot be blank"));
            }
            // Echoed back in the Matched-Stub-Name header.
            if axum::http::HeaderValue::from_str(name).is_err() {
                return Err(StubError::malformed(format!(
                    "stub name {:?} is not a valid header value",
                    name
                )));
            }
        }
        self.request.validate()?;
        self.response.validate()?;
        Ok(())
    }
}

/// Request matching rules shared by stubs and verification queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestPattern {
    /// HTTP method(s) to match (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub method: Vec<String>,

    /// URL matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlMatcher>,

    /// Query parameter matching
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, QueryMatcher>,

    /// Header matching (names compare case-insensitively)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderMatcher>,

    /// Body matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyMatcher>,
}

impl RequestPattern {
    /// Validate the request pattern.
    pub fn validate(&self) -> Result<(), StubError> {
        for method in &self.method {
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(StubError::malformed(format!("invalid method {:?}", method)));
            }
        }
        if let Some(url) = &self.url {
            url.validate()?;
        }

        let mut seen = HashSet::new();
        for (name, matcher) in &self.headers {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(StubError::malformed(format!(
                    "header {} has more than one predicate",
                    name
                )));
            }
            matcher.validate()?;
        }
        for matcher in self.query.values() {
            matcher.validate()?;
        }
        if let Some(body) = &self.body {
            body.validate()?;
        }
        Ok(())
    }
}

/// URL matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UrlMatcher {
    /// Exact match on the path (and query string when the value has one)
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex matched against the whole path
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

impl UrlMatcher {
    pub fn exact(value: impl Into<String>) -> Self {
        UrlMatcher::Exact { value: value.into() }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        UrlMatcher::Prefix { value: value.into() }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        UrlMatcher::Regex {
            pattern: pattern.into(),
        }
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        UrlMatcher::Glob {
            pattern: pattern.into(),
        }
    }

    pub fn template(template: impl Into<String>) -> Self {
        UrlMatcher::Template {
            template: template.into(),
        }
    }

    /// Validate the URL matcher.
    pub fn validate(&self) -> Result<(), StubError> {
        match self {
            UrlMatcher::Exact { value } | UrlMatcher::Prefix { value } => {
                if !value.starts_with('/') {
                    return Err(StubError::malformed(format!(
                        "URL {:?} must start with '/'",
                        value
                    )));
                }
            }
            UrlMatcher::Regex { pattern } => {
                regex::Regex::new(pattern)
                    .map_err(|e| StubError::malformed(format!("invalid regex: {}", e)))?;
            }
            UrlMatcher::Glob { pattern } => {
                globset::Glob::new(pattern)
                    .map_err(|e| StubError::malformed(format!("invalid glob: {}", e)))?;
            }
            UrlMatcher::Template { template } => validate_template(template)?,
        }
        Ok(())
    }
}

fn validate_template(template: &str) -> Result<(), StubError> {
    if !template.starts_with('/') {
        return Err(StubError::malformed(format!(
            "template {:?} must start with '/'",
            template
        )));
    }
    let mut open = false;
    let mut name_len = 0;
    for ch in template.chars() {
        match ch {
            '{' if open => {
                return Err(StubError::malformed(format!("nested '{{' in {:?}", template)))
            }
            '{' => {
                open = true;
                name_len = 0;
            }
            '}' if !open => {
                return Err(StubError::malformed(format!("unmatched '}}' in {:?}", template)))
            }
            '}' => {
                if name_len == 0 {
                    return Err(StubError::malformed(format!(
                        "empty parameter name in {:?}",
                        template
                    )));
                }
                open = false;
            }
            _ if open => name_len += 1,
            _ => {}
        }
    }
    if open {
        return Err(StubError::malformed(format!("unclosed '{{' in {:?}", template)));
    }
    Ok(())
}

/// Query parameter matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

impl QueryMatcher {
    pub fn validate(&self) -> Result<(), StubError> {
        if let QueryMatcher::Regex { pattern } = self {
            regex::Regex::new(pattern)
                .map_err(|e| StubError::malformed(format!("invalid query regex: {}", e)))?;
        }
        Ok(())
    }
}

/// Header matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

impl HeaderMatcher {
    pub fn validate(&self) -> Result<(), StubError> {
        if let HeaderMatcher::Regex { pattern } = self {
            regex::Regex::new(pattern)
                .map_err(|e| StubError::malformed(format!("invalid header regex: {}", e)))?;
        }
        Ok(())
    }
}

/// Body matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyMatcher {
    /// Exact body match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path expressions and expected values (null = path must exist)
    JsonPath {
        expressions: BTreeMap<String, serde_json::Value>,
    },
    /// Body must contain substring
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be empty
    Empty,
}

impl BodyMatcher {
    pub fn validate(&self) -> Result<(), StubError> {
        match self {
            BodyMatcher::Regex { pattern } => {
                regex::Regex::new(pattern)
                    .map_err(|e| StubError::malformed(format!("invalid body regex: {}", e)))?;
            }
            BodyMatcher::JsonPath { expressions } => {
                if expressions.is_empty() {
                    return Err(StubError::malformed("json_path matcher needs an expression"));
                }
                for expr in expressions.keys() {
                    crate::json_path::validate(expr).map_err(StubError::malformed)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Response definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,

    /// Render the body as a Handlebars template
    #[serde(default)]
    pub template: bool,

    /// Fixed delay before responding
    #[serde(default)]
    pub fixed_delay_ms: u64,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: BTreeMap::new(),
            body: None,
            template: false,
            fixed_delay_ms: 0,
        }
    }
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> Result<(), StubError> {
        if !(100..=599).contains(&self.status) {
            return Err(StubError::malformed(format!(
                "invalid status code: {}",
                self.status
            )));
        }
        for (name, value) in &self.headers {
            if axum::http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(StubError::malformed(format!("invalid header name {:?}", name)));
            }
            if axum::http::HeaderValue::from_str(value).is_err() {
                return Err(StubError::malformed(format!(
                    "invalid value for header {}",
                    name
                )));
            }
        }
        if let Some(body) = &self.body {
            if self.template {
                body.compile_templates()?;
            }
            body.to_bytes()?;
        }
        Ok(())
    }

    /// Look up a configured response header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response body configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StubError> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => serde_json::to_vec(content)
                .map_err(|e| StubError::malformed(format!("unserializable JSON body: {}", e))),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| StubError::malformed(format!("invalid base64 body: {}", e)))
            }
        }
    }

    /// Parse every template in the body without rendering it.
    fn compile_templates(&self) -> Result<(), StubError> {
        match self {
            ResponseBody::Text { content } => compile_template(content),
            ResponseBody::Json { content } => compile_json_templates(content),
            ResponseBody::Base64 { .. } => {
                Err(StubError::malformed("binary bodies cannot be templated"))
            }
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
        }
    }
}

fn compile_template(source: &str) -> Result<(), StubError> {
    handlebars::Template::compile(source)
        .map(|_| ())
        .map_err(|e| StubError::malformed(format!("invalid response template: {}", e)))
}

/// Only strings containing `{{` are rendered, so only those are compiled.
fn compile_json_templates(value: &serde_json::Value) -> Result<(), StubError> {
    use serde_json::Value;

    match value {
        Value::String(s) if s.contains("{{") => compile_template(s),
        Value::Array(items) => items.iter().try_for_each(compile_json_templates),
        Value::Object(fields) => fields.values().try_for_each(compile_json_templates),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_stub() {
        let yaml = r#"
stubs:
  - name: mock_demo_1
    request:
      method: [GET]
      url:
        type: exact
        value: /mock/demo/1
    response:
      status: 200
      headers:
        Content-Type: text/plain
      body:
        type: text
        content: "Hello world!"
"#;
        let config = StubServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.stubs.len(), 1);
        assert_eq!(config.stubs[0].name.as_deref(), Some("mock_demo_1"));
        assert_eq!(config.stubs[0].response.header("content-type"), Some("text/plain"));
        assert_eq!(config.server.port, 0);
    }

    #[test]
    fn test_parse_json_response() {
        let yaml = r#"
stubs:
  - request:
      url:
        type: prefix
        value: /api
    response:
      body:
        type: json
        content:
          lotto:
            lottoId: 5
"#;
        let config = StubServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.stubs[0].response.status, 200);

        if let Some(ResponseBody::Json { content }) = &config.stubs[0].response.body {
            assert_eq!(content["lotto"]["lottoId"], 5);
        } else {
            panic!("Expected JSON body");
        }
    }

    #[test]
    fn test_parse_server_options() {
        let yaml = r#"
server:
  port: 8080
  verbose: true
"#;
        let config = StubServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:8080");
        assert!(config.server.verbose);
        assert!(config.server.log_unmatched);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
stubs:
  - request:
      path: /nope
"#;
        assert!(matches!(
            StubServerConfig::from_yaml(yaml),
            Err(StubError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_regex_is_malformed() {
        let pattern = RequestPattern {
            url: Some(UrlMatcher::regex("/api/(unclosed")),
            ..Default::default()
        };
        assert!(matches!(pattern.validate(), Err(StubError::MalformedStub(_))));
    }

    #[test]
    fn test_contradictory_headers_are_malformed() {
        let mut pattern = RequestPattern::default();
        pattern.headers.insert(
            "Content-Type".to_string(),
            HeaderMatcher::Exact {
                value: "text/plain".to_string(),
            },
        );
        pattern
            .headers
            .insert("content-type".to_string(), HeaderMatcher::Absent);
        assert!(matches!(pattern.validate(), Err(StubError::MalformedStub(_))));
    }

    #[test]
    fn test_template_validation() {
        assert!(UrlMatcher::template("/users/{id}").validate().is_ok());
        assert!(UrlMatcher::template("/users/{id").validate().is_err());
        assert!(UrlMatcher::template("/users/{}").validate().is_err());
        assert!(UrlMatcher::template("users/{id}").validate().is_err());
    }

    #[test]
    fn test_response_templates_compiled() {
        let text = |content: &str| ResponseDefinition {
            body: Some(ResponseBody::Text {
                content: content.to_string(),
            }),
            template: true,
            ..Default::default()
        };
        assert!(text("Hello {{path.name}}").validate().is_ok());
        assert!(matches!(
            text("{{#if}").validate(),
            Err(StubError::MalformedStub(_))
        ));

        let json = ResponseDefinition {
            body: Some(ResponseBody::Json {
                content: serde_json::json!({"ok": "{{path.id}}", "items": ["{{#each}}"]}),
            }),
            template: true,
            ..Default::default()
        };
        assert!(json.validate().is_err());

        // Untemplated bodies are served verbatim.
        let literal = ResponseDefinition {
            template: false,
            ..text("{{#if}")
        };
        assert!(literal.validate().is_ok());
    }

    #[test]
    fn test_stub_name_must_be_header_safe() {
        let stub = |name: &str| StubDefinition {
            name: Some(name.to_string()),
            request: RequestPattern::default(),
            response: ResponseDefinition::default(),
            priority: 0,
        };
        assert!(stub("mock_demo_1").validate().is_ok());
        assert!(matches!(
            stub("démo").validate(),
            Err(StubError::MalformedStub(_))
        ));
        assert!(stub("line\nbreak").validate().is_err());
    }

    #[test]
    fn test_status_range() {
        let response = ResponseDefinition {
            status: 700,
            ..Default::default()
        };
        assert!(response.validate().is_err());
        assert!(ResponseDefinition::default().validate().is_ok());
    }

    #[test]
    fn test_response_body_to_bytes() {
        let text = ResponseBody::Text {
            content: "hello".to_string(),
        };
        assert_eq!(text.to_bytes().unwrap(), b"hello");

        let binary = ResponseBody::Base64 {
            content: "aGVsbG8=".to_string(),
        };
        assert_eq!(binary.to_bytes().unwrap(), b"hello");

        let broken = ResponseBody::Base64 {
            content: "%%%".to_string(),
        };
        assert!(broken.to_bytes().is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "stubs:\n  - request:\n      url:\n        type: exact\n        value: /ping\n"
        )
        .unwrap();

        let config = StubServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stubs.len(), 1);
        assert_eq!(
            config.stubs[0].request.url,
            Some(UrlMatcher::exact("/ping"))
        );
    }
}
