//! Response templating.
//!
//! Templated stub bodies are rendered with Handlebars against the request
//! that matched them.

use crate::journal::LoggedRequest;
use crate::matcher::MatchContext;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Values visible to a response template.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Path parameters from URL template matching
    pub path: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Request headers, keyed by lower-cased name
    pub headers: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    pub method: String,
    /// Full request URL (path and query)
    pub url: String,
    pub request_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body parsed as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

impl TemplateContext {
    fn new(match_ctx: &MatchContext, request: &LoggedRequest) -> Self {
        let body = request.body_text().map(str::to_string);
        let json = body.as_deref().and_then(|b| serde_json::from_str(b).ok());
        Self {
            path: match_ctx.path_params.clone(),
            query: match_ctx.query_params.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
            captures: match_ctx.captures.clone(),
            method: request.method.clone(),
            url: request.url.clone(),
            request_path: request.path.clone(),
            body,
            json,
        }
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("random_int", Box::new(random_int_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("json_path", Box::new(json_path_helper));

        // Bodies are not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a text template against a request.
    pub fn render(
        &self,
        template: &str,
        match_ctx: &MatchContext,
        request: &LoggedRequest,
    ) -> Result<String, handlebars::RenderError> {
        let ctx = TemplateContext::new(match_ctx, request);
        self.handlebars.render_template(template, &ctx)
    }

    /// Render every string inside a JSON document.
    pub fn render_json(
        &self,
        json: &serde_json::Value,
        match_ctx: &MatchContext,
        request: &LoggedRequest,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        let ctx = TemplateContext::new(match_ctx, request);
        self.render_value(json, &ctx)
    }

    fn render_value(
        &self,
        value: &serde_json::Value,
        ctx: &TemplateContext,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        use serde_json::Value;

        Ok(match value {
            Value::String(s) if s.contains("{{") => {
                Value::String(self.handlebars.render_template(s, ctx)?)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => {
                let mut rendered = serde_json::Map::with_capacity(fields.len());
                for (k, v) in fields {
                    rendered.insert(k.clone(), self.render_value(v, ctx)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn str_param<'a>(h: &'a handlebars::Helper, index: usize) -> Option<&'a str> {
    h.param(index).and_then(|v| v.value().as_str())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use std::fmt::Write;

    let format = str_param(h, 0).unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    // An unknown specifier fails the write rather than rendering.
    let mut rendered = String::new();
    write!(rendered, "{}", chrono::Utc::now().format(format)).map_err(|_| {
        handlebars::RenderErrorReason::Other(format!("invalid date format {:?}", format))
    })?;
    out.write(&rendered)?;
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    out.write(&format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))?;
    Ok(())
}

fn random_int_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100).max(min);
    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let fallback = str_param(h, 1).unwrap_or("");
    let rendered = match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::Null) | None => fallback.to_string(),
        Some(serde_json::Value::String(s)) if s.is_empty() => fallback.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    out.write(&rendered)?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&str_param(h, 0).unwrap_or("").to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&str_param(h, 0).unwrap_or("").to_lowercase())?;
    Ok(())
}

/// `{{json_path json "$.user.name"}}` writes the first selected value.
fn json_path_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let document = h.param(0).map(|v| v.value().clone()).unwrap_or_default();
    let expression = str_param(h, 1).unwrap_or("$");

    let first = crate::json_path::select(&document, expression)
        .ok()
        .and_then(|values| values.into_iter().next());
    match first {
        Some(serde_json::Value::String(s)) => out.write(&s)?,
        Some(value) => out.write(&value.to_string())?,
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> LoggedRequest {
        LoggedRequest::new("GET", url, HashMap::new(), Vec::new())
    }

    #[test]
    fn test_path_params() {
        let engine = TemplateEngine::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "123".to_string());

        let result = engine
            .render("User ID: {{path.id}}", &ctx, &request("/users/123"))
            .unwrap();
        assert_eq!(result, "User ID: 123");
    }

    #[test]
    fn test_request_fields() {
        let engine = TemplateEngine::new();
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), "test-client".to_string());
        let request = LoggedRequest::new("get", "/echo?x=1", headers, Vec::new());

        let result = engine
            .render(
                "{{method}} {{request_path}} {{url}} {{headers.user-agent}}",
                &MatchContext::default(),
                &request,
            )
            .unwrap();
        assert_eq!(result, "GET /echo /echo?x=1 test-client");
    }

    #[test]
    fn test_request_body_json() {
        let engine = TemplateEngine::new();
        let mut request = LoggedRequest::new("POST", "/users", HashMap::new(), Vec::new());
        request.body = br#"{"user":{"name":"John"}}"#.to_vec();

        let result = engine
            .render(
                "{{json.user.name}} / {{json_path json \"$.user.name\"}}",
                &MatchContext::default(),
                &request,
            )
            .unwrap();
        assert_eq!(result, "John / John");
    }

    #[test]
    fn test_now_helper_formats() {
        let engine = TemplateEngine::new();
        let year = engine
            .render("{{now \"%Y\"}}", &MatchContext::default(), &request("/"))
            .unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_now_helper_rejects_unknown_specifier() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{now \"%Q\"}}", &MatchContext::default(), &request("/"));
        assert!(result.is_err());
    }

    #[test]
    fn test_uuid_helper() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("{{uuid}}", &MatchContext::default(), &request("/"))
            .unwrap();

        assert_eq!(result.len(), 36);
        assert_eq!(result.chars().nth(14), Some('4'));
        assert_eq!(result.matches('-').count(), 4);
    }

    #[test]
    fn test_random_int_helper() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("{{random_int 5 7}}", &MatchContext::default(), &request("/"))
            .unwrap();
        let value: i64 = result.parse().unwrap();
        assert!((5..=7).contains(&value));
    }

    #[test]
    fn test_default_and_case_helpers() {
        let engine = TemplateEngine::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("name".to_string(), "John".to_string());

        let result = engine
            .render(
                "{{default query.missing \"none\"}} {{upper path.name}} {{lower path.name}}",
                &ctx,
                &request("/"),
            )
            .unwrap();
        assert_eq!(result, "none JOHN john");
    }

    #[test]
    fn test_render_json() {
        let engine = TemplateEngine::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "5".to_string());

        let json = serde_json::json!({
            "lotto": {"lottoId": "{{path.id}}", "winners": [{"winnerId": 23}]},
            "static": "no template"
        });
        let result = engine.render_json(&json, &ctx, &request("/lotto/5")).unwrap();

        assert_eq!(result["lotto"]["lottoId"], "5");
        assert_eq!(result["lotto"]["winners"][0]["winnerId"], 23);
        assert_eq!(result["static"], "no template");
    }
}
