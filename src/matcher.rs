//! Request matching logic.
//!
//! A [`RequestPattern`] is compiled once into a list of predicates. The same
//! compiled form serves stub selection, near-miss diagnostics and journal
//! verification.

use crate::config::{BodyMatcher, HeaderMatcher, QueryMatcher, RequestPattern, UrlMatcher};
use crate::error::StubError;
use crate::journal::LoggedRequest;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// Why a request failed a pattern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mismatch {
    /// Descriptions of the failed predicates, in evaluation order
    pub failures: Vec<String>,
    /// Summed weight of the failed predicates
    pub distance: u32,
}

/// One condition a request must satisfy.
pub(crate) trait Predicate: Send + Sync {
    fn test(&self, request: &LoggedRequest, context: &mut MatchContext) -> bool;

    /// Contribution to the pattern's specificity.
    fn weight(&self) -> u32;

    fn describe(&self) -> String;
}

/// A request pattern compiled for evaluation.
pub struct CompiledPattern {
    predicates: Vec<Box<dyn Predicate>>,
    methods: Vec<String>,
    index_segment: Option<String>,
    specificity: u32,
}

impl std::fmt::Debug for CompiledPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPattern")
            .field("pattern", &self.describe())
            .field("specificity", &self.specificity)
            .finish()
    }
}

impl CompiledPattern {
    /// Validate and compile a pattern.
    pub fn compile(pattern: &RequestPattern) -> Result<Self, StubError> {
        pattern.validate()?;

        let mut predicates: Vec<Box<dyn Predicate>> = Vec::new();
        let methods: Vec<String> = pattern
            .method
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect();
        if !methods.is_empty() {
            predicates.push(Box::new(MethodPredicate {
                methods: methods.clone(),
            }));
        }

        let mut index_segment = None;
        if let Some(url) = &pattern.url {
            index_segment = leading_segment(url);
            predicates.push(Box::new(UrlPredicate::compile(url)?));
        }

        for (name, matcher) in &pattern.query {
            predicates.push(Box::new(QueryPredicate {
                name: name.clone(),
                rule: ValueRule::from_query(matcher)?,
            }));
        }

        for (name, matcher) in &pattern.headers {
            predicates.push(Box::new(HeaderPredicate {
                name: name.clone(),
                rule: ValueRule::from_header(matcher)?,
            }));
        }

        if let Some(body) = &pattern.body {
            predicates.push(Box::new(BodyPredicate::compile(body)?));
        }

        let specificity = predicates.iter().map(|p| p.weight()).sum();

        Ok(Self {
            predicates,
            methods,
            index_segment,
            specificity,
        })
    }

    /// True when every predicate holds.
    pub fn matches(&self, request: &LoggedRequest) -> bool {
        let mut context = MatchContext::default();
        self.predicates.iter().all(|p| p.test(request, &mut context))
    }

    /// Evaluate every predicate. On success returns the captured context,
    /// otherwise the predicates that failed.
    pub fn evaluate(&self, request: &LoggedRequest) -> Result<MatchContext, Mismatch> {
        let mut context = MatchContext {
            query_params: parse_query_string(request.query.as_deref().unwrap_or("")),
            ..Default::default()
        };

        let mut mismatch = Mismatch::default();
        for predicate in &self.predicates {
            if !predicate.test(request, &mut context) {
                mismatch.failures.push(predicate.describe());
                mismatch.distance += predicate.weight();
            }
        }

        if mismatch.failures.is_empty() {
            Ok(context)
        } else {
            Err(mismatch)
        }
    }

    /// Higher means more constrained.
    pub fn specificity(&self) -> u32 {
        self.specificity
    }

    /// Upper-cased methods (empty = any).
    pub(crate) fn methods(&self) -> &[String] {
        &self.methods
    }

    /// First path segment every matching request must start with, if known.
    pub(crate) fn index_segment(&self) -> Option<&str> {
        self.index_segment.as_deref()
    }

    pub fn describe(&self) -> String {
        if self.predicates.is_empty() {
            return "any request".to_string();
        }
        self.predicates
            .iter()
            .map(|p| p.describe())
            .collect::<Vec<_>>()
            .join(" and ")
    }
}

/// First path segment of a request path.
pub(crate) fn request_segment(path: &str) -> &str {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.split('/').next().unwrap_or("")
}

fn leading_segment(url: &UrlMatcher) -> Option<String> {
    match url {
        UrlMatcher::Exact { value } => {
            let path = value.split('?').next().unwrap_or(value);
            Some(request_segment(path).to_string())
        }
        UrlMatcher::Prefix { value } => {
            let trimmed = value.strip_prefix('/')?;
            trimmed.find('/').map(|pos| trimmed[..pos].to_string())
        }
        UrlMatcher::Template { template } => {
            let trimmed = template.strip_prefix('/')?;
            let literal = trimmed.split('{').next().unwrap_or("");
            match literal.find('/') {
                Some(pos) => Some(literal[..pos].to_string()),
                None if !trimmed.contains('{') => Some(literal.to_string()),
                None => None,
            }
        }
        UrlMatcher::Regex { .. } | UrlMatcher::Glob { .. } => None,
    }
}

struct MethodPredicate {
    methods: Vec<String>,
}

impl Predicate for MethodPredicate {
    fn test(&self, request: &LoggedRequest, _: &mut MatchContext) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(&request.method))
    }

    fn weight(&self) -> u32 {
        1
    }

    fn describe(&self) -> String {
        format!("method is {}", self.methods.join("|"))
    }
}

enum CompiledUrl {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
    Template(PathTemplate),
}

struct UrlPredicate {
    url: CompiledUrl,
    source: String,
}

impl UrlPredicate {
    fn compile(url: &UrlMatcher) -> Result<Self, StubError> {
        let compiled = match url {
            UrlMatcher::Exact { value } => CompiledUrl::Exact(value.clone()),
            UrlMatcher::Prefix { value } => CompiledUrl::Prefix(value.clone()),
            UrlMatcher::Regex { pattern } => {
                let anchored = format!("^(?:{})$", pattern);
                CompiledUrl::Regex(
                    Regex::new(&anchored)
                        .map_err(|e| StubError::malformed(format!("invalid regex: {}", e)))?,
                )
            }
            UrlMatcher::Glob { pattern } => {
                let glob = globset::Glob::new(pattern)
                    .map_err(|e| StubError::malformed(format!("invalid glob: {}", e)))?;
                CompiledUrl::Glob(glob.compile_matcher())
            }
            UrlMatcher::Template { template } => CompiledUrl::Template(PathTemplate::parse(template)),
        };

        let source = match url {
            UrlMatcher::Exact { value } => format!("URL equals {}", value),
            UrlMatcher::Prefix { value } => format!("path starts with {}", value),
            UrlMatcher::Regex { pattern } => format!("path matches /{}/", pattern),
            UrlMatcher::Glob { pattern } => format!("path matches glob {}", pattern),
            UrlMatcher::Template { template } => format!("path fits {}", template),
        };

        Ok(Self {
            url: compiled,
            source,
        })
    }
}

impl Predicate for UrlPredicate {
    fn test(&self, request: &LoggedRequest, context: &mut MatchContext) -> bool {
        let path = request.path.as_str();
        match &self.url {
            CompiledUrl::Exact(value) if value.contains('?') => request.url == *value,
            CompiledUrl::Exact(value) => path == value,
            CompiledUrl::Prefix(value) => path.starts_with(value.as_str()),
            CompiledUrl::Regex(regex) => {
                let Some(captures) = regex.captures(path) else {
                    return false;
                };
                for (i, group) in captures.iter().enumerate().skip(1) {
                    if let Some(m) = group {
                        context.captures.insert(i.to_string(), m.as_str().to_string());
                    }
                }
                for name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        context.captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                true
            }
            CompiledUrl::Glob(glob) => glob.is_match(path),
            CompiledUrl::Template(template) => match template.matches(path) {
                Some(params) => {
                    context.path_params = params;
                    true
                }
                None => false,
            },
        }
    }

    fn weight(&self) -> u32 {
        match self.url {
            CompiledUrl::Exact(_) => 8,
            CompiledUrl::Template(_) => 6,
            CompiledUrl::Prefix(_) | CompiledUrl::Regex(_) | CompiledUrl::Glob(_) => 4,
        }
    }

    fn describe(&self) -> String {
        self.source.clone()
    }
}

struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(TemplateSegment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').map(|c| open + c).unwrap_or(rest.len());
            segments.push(TemplateSegment::Param(rest[open + 1..close].to_string()));
            rest = rest.get(close + 1..).unwrap_or("");
        }
        if !rest.is_empty() {
            segments.push(TemplateSegment::Literal(rest.to_string()));
        }

        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut rest = path;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => rest = rest.strip_prefix(lit.as_str())?,
                TemplateSegment::Param(name) => {
                    // A parameter never spans a '/'.
                    let limit = rest.find('/').unwrap_or(rest.len());
                    let end = match self.segments.get(i + 1) {
                        Some(TemplateSegment::Literal(next)) => {
                            rest[..limit].find(next.as_str()).unwrap_or(limit)
                        }
                        _ => limit,
                    };
                    if end == 0 {
                        return None;
                    }
                    params.insert(name.clone(), rest[..end].to_string());
                    rest = &rest[end..];
                }
            }
        }

        rest.is_empty().then_some(params)
    }
}

/// Value rule shared by header and query predicates.
enum ValueRule {
    Exact(String),
    Regex(Regex),
    Contains(String),
    Present,
    Absent,
}

impl ValueRule {
    fn from_header(matcher: &HeaderMatcher) -> Result<Self, StubError> {
        Ok(match matcher {
            HeaderMatcher::Exact { value } => ValueRule::Exact(value.clone()),
            HeaderMatcher::Regex { pattern } => ValueRule::Regex(compile_regex(pattern)?),
            HeaderMatcher::Contains { value } => ValueRule::Contains(value.clone()),
            HeaderMatcher::Present => ValueRule::Present,
            HeaderMatcher::Absent => ValueRule::Absent,
        })
    }

    fn from_query(matcher: &QueryMatcher) -> Result<Self, StubError> {
        Ok(match matcher {
            QueryMatcher::Exact { value } => ValueRule::Exact(value.clone()),
            QueryMatcher::Regex { pattern } => ValueRule::Regex(compile_regex(pattern)?),
            QueryMatcher::Present => ValueRule::Present,
            QueryMatcher::Absent => ValueRule::Absent,
        })
    }

    fn test(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (ValueRule::Absent, value) => value.is_none(),
            (_, None) => false,
            (ValueRule::Exact(expected), Some(v)) => v == expected,
            (ValueRule::Regex(regex), Some(v)) => regex.is_match(v),
            (ValueRule::Contains(part), Some(v)) => v.contains(part.as_str()),
            (ValueRule::Present, Some(_)) => true,
        }
    }

    fn weight(&self) -> u32 {
        match self {
            ValueRule::Exact(_) => 4,
            ValueRule::Regex(_) | ValueRule::Contains(_) => 3,
            ValueRule::Present | ValueRule::Absent => 2,
        }
    }

    fn describe(&self) -> String {
        match self {
            ValueRule::Exact(v) => format!("equals {}", v),
            ValueRule::Regex(r) => format!("matches /{}/", r.as_str()),
            ValueRule::Contains(v) => format!("contains {}", v),
            ValueRule::Present => "is present".to_string(),
            ValueRule::Absent => "is absent".to_string(),
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, StubError> {
    Regex::new(pattern).map_err(|e| StubError::malformed(format!("invalid regex: {}", e)))
}

struct HeaderPredicate {
    name: String,
    rule: ValueRule,
}

impl Predicate for HeaderPredicate {
    fn test(&self, request: &LoggedRequest, _: &mut MatchContext) -> bool {
        self.rule.test(request.header(&self.name))
    }

    fn weight(&self) -> u32 {
        self.rule.weight()
    }

    fn describe(&self) -> String {
        format!("header {} {}", self.name, self.rule.describe())
    }
}

struct QueryPredicate {
    name: String,
    rule: ValueRule,
}

impl Predicate for QueryPredicate {
    fn test(&self, request: &LoggedRequest, context: &mut MatchContext) -> bool {
        let params = parse_query_string(request.query.as_deref().unwrap_or(""));
        let ok = self.rule.test(params.get(&self.name).map(String::as_str));
        context.query_params = params;
        ok
    }

    fn weight(&self) -> u32 {
        2
    }

    fn describe(&self) -> String {
        format!("query {} {}", self.name, self.rule.describe())
    }
}

enum BodyRule {
    Exact(String),
    Regex(Regex),
    Contains(String),
    Json,
    JsonPath(BTreeMap<String, serde_json::Value>),
    Empty,
}

struct BodyPredicate {
    rule: BodyRule,
}

impl BodyPredicate {
    fn compile(matcher: &BodyMatcher) -> Result<Self, StubError> {
        let rule = match matcher {
            BodyMatcher::Exact { value } => BodyRule::Exact(value.clone()),
            BodyMatcher::Regex { pattern } => BodyRule::Regex(compile_regex(pattern)?),
            BodyMatcher::Contains { value } => BodyRule::Contains(value.clone()),
            BodyMatcher::Json => BodyRule::Json,
            BodyMatcher::JsonPath { expressions } => BodyRule::JsonPath(expressions.clone()),
            BodyMatcher::Empty => BodyRule::Empty,
        };
        Ok(Self { rule })
    }
}

impl Predicate for BodyPredicate {
    fn test(&self, request: &LoggedRequest, _: &mut MatchContext) -> bool {
        let text = request.body_text();
        match &self.rule {
            BodyRule::Exact(value) => text == Some(value.as_str()),
            BodyRule::Regex(regex) => text.map(|t| regex.is_match(t)).unwrap_or(false),
            BodyRule::Contains(value) => text.map(|t| t.contains(value.as_str())).unwrap_or(false),
            BodyRule::Json => serde_json::from_slice::<serde_json::Value>(&request.body).is_ok(),
            BodyRule::JsonPath(expressions) => {
                match serde_json::from_slice::<serde_json::Value>(&request.body) {
                    Ok(json) => matches_json_paths(&json, expressions),
                    Err(_) => false,
                }
            }
            BodyRule::Empty => request.body.is_empty(),
        }
    }

    fn weight(&self) -> u32 {
        2
    }

    fn describe(&self) -> String {
        match &self.rule {
            BodyRule::Exact(v) => format!("body equals {:?}", v),
            BodyRule::Regex(r) => format!("body matches /{}/", r.as_str()),
            BodyRule::Contains(v) => format!("body contains {:?}", v),
            BodyRule::Json => "body is JSON".to_string(),
            BodyRule::JsonPath(expressions) => {
                let parts: Vec<_> = expressions
                    .iter()
                    .map(|(path, expected)| format!("{} = {}", path, expected))
                    .collect();
                format!("body JSON has {}", parts.join(", "))
            }
            BodyRule::Empty => "body is empty".to_string(),
        }
    }
}

fn matches_json_paths(
    json: &serde_json::Value,
    expressions: &BTreeMap<String, serde_json::Value>,
) -> bool {
    expressions.iter().all(|(expr, expected)| {
        let Ok(values) = crate::json_path::select(json, expr) else {
            return false;
        };
        if expected.is_null() {
            !values.is_empty()
        } else {
            values.contains(expected) || serde_json::Value::Array(values) == *expected
        }
    })
}

/// Parse a query string into key-value pairs.
pub(crate) fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
