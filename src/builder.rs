//! Fluent construction of stubs and verification patterns.
//!
//! ```
//! use mock_stub_server::builder::{a_response, get, url_equal_to};
//!
//! let stub = get(url_equal_to("/mock/demo/1"))
//!     .with_name("mock_demo_1")
//!     .will_return(
//!         a_response()
//!             .with_status(200)
//!             .with_header("Content-Type", "text/plain")
//!             .with_text_body("Hello world!"),
//!     );
//! assert_eq!(stub.name.as_deref(), Some("mock_demo_1"));
//! ```

use crate::config::{
    BodyMatcher, HeaderMatcher, QueryMatcher, RequestPattern, ResponseBody, ResponseDefinition,
    StubDefinition, UrlMatcher,
};

impl RequestPattern {
    /// Pattern for one method (`None` = any) and URL rule.
    pub fn new(method: Option<&str>, url: UrlMatcher) -> Self {
        Self {
            method: method.map(|m| vec![m.to_ascii_uppercase()]).unwrap_or_default(),
            url: Some(url),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.headers.insert(name.into(), matcher);
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, matcher: QueryMatcher) -> Self {
        self.query.insert(name.into(), matcher);
        self
    }

    pub fn with_request_body(mut self, matcher: BodyMatcher) -> Self {
        self.body = Some(matcher);
        self
    }
}

impl StubDefinition {
    /// Stub answering `request` with a bare 200.
    pub fn new(request: RequestPattern) -> Self {
        Self {
            name: None,
            request,
            response: ResponseDefinition::default(),
            priority: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.request = self.request.with_header(name, matcher);
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, matcher: QueryMatcher) -> Self {
        self.request = self.request.with_query_param(name, matcher);
        self
    }

    pub fn with_request_body(mut self, matcher: BodyMatcher) -> Self {
        self.request = self.request.with_request_body(matcher);
        self
    }

    pub fn at_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn will_return(mut self, response: ResponseDefinition) -> Self {
        self.response = response;
        self
    }
}

impl ResponseDefinition {
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_text_body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(ResponseBody::Text {
            content: content.into(),
        });
        self
    }

    pub fn with_json_body(mut self, content: serde_json::Value) -> Self {
        self.body = Some(ResponseBody::Json { content });
        self
    }

    /// Binary body, given base64 encoded.
    pub fn with_base64_body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(ResponseBody::Base64 {
            content: content.into(),
        });
        self
    }

    /// Render the body as a template against the request.
    pub fn templated(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn with_fixed_delay(mut self, millis: u64) -> Self {
        self.fixed_delay_ms = millis;
        self
    }
}

/// A 200 response with no body.
pub fn a_response() -> ResponseDefinition {
    ResponseDefinition::default()
}

pub fn get(url: UrlMatcher) -> StubDefinition {
    StubDefinition::new(RequestPattern::new(Some("GET"), url))
}

pub fn post(url: UrlMatcher) -> StubDefinition {
    StubDefinition::new(RequestPattern::new(Some("POST"), url))
}

pub fn put(url: UrlMatcher) -> StubDefinition {
    StubDefinition::new(RequestPattern::new(Some("PUT"), url))
}

pub fn delete(url: UrlMatcher) -> StubDefinition {
    StubDefinition::new(RequestPattern::new(Some("DELETE"), url))
}

/// Stub matching any method.
pub fn any(url: UrlMatcher) -> StubDefinition {
    StubDefinition::new(RequestPattern::new(None, url))
}

pub fn get_requested_for(url: UrlMatcher) -> RequestPattern {
    RequestPattern::new(Some("GET"), url)
}

pub fn post_requested_for(url: UrlMatcher) -> RequestPattern {
    RequestPattern::new(Some("POST"), url)
}

pub fn any_requested_for(url: UrlMatcher) -> RequestPattern {
    RequestPattern::new(None, url)
}

pub fn url_equal_to(url: impl Into<String>) -> UrlMatcher {
    UrlMatcher::exact(url)
}

pub fn url_path_prefix(prefix: impl Into<String>) -> UrlMatcher {
    UrlMatcher::prefix(prefix)
}

pub fn url_matching(pattern: impl Into<String>) -> UrlMatcher {
    UrlMatcher::regex(pattern)
}

pub fn url_path_template(template: impl Into<String>) -> UrlMatcher {
    UrlMatcher::template(template)
}

pub fn equal_to(value: impl Into<String>) -> HeaderMatcher {
    HeaderMatcher::Exact {
        value: value.into(),
    }
}

pub fn matching(pattern: impl Into<String>) -> HeaderMatcher {
    HeaderMatcher::Regex {
        pattern: pattern.into(),
    }
}

pub fn containing(value: impl Into<String>) -> HeaderMatcher {
    HeaderMatcher::Contains {
        value: value.into(),
    }
}
