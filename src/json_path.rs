//! JSON path selection shared by body matching and response assertions.
//!
//! Two forms are accepted. Full JSONPath (`$.lotto.winners[*].winnerId`)
//! goes through jsonpath-rust. Dotted shorthand (`lotto.winners.winnerId`)
//! walks fields and steps through every element of an array it meets, so
//! the shorthand above selects the same values as the JSONPath form.

use jsonpath_rust::JsonPath;
use serde_json::Value;

/// Dotted shorthand holds only field names separated by dots.
fn is_shorthand(expression: &str) -> bool {
    !expression.starts_with('$')
        && !expression
            .chars()
            .any(|c| matches!(c, '[' | ']' | '*' | '(' | ')' | '?' | '@'))
}

/// Turn anything that is not shorthand into a rooted JSONPath.
pub(crate) fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('$') {
        trimmed.to_string()
    } else if trimmed.starts_with('[') {
        format!("${}", trimmed)
    } else {
        format!("$.{}", trimmed)
    }
}

/// Check that an expression parses.
pub(crate) fn validate(expression: &str) -> Result<(), String> {
    let trimmed = expression.trim();
    if is_shorthand(trimmed) {
        return if trimmed.split('.').any(str::is_empty) {
            Err(format!("invalid JSON path {:?}: empty segment", trimmed))
        } else {
            Ok(())
        };
    }
    let normalized = normalize(trimmed);
    JsonPath::<Value>::try_from(normalized.as_str())
        .map(|_| ())
        .map_err(|e| format!("invalid JSON path {}: {}", normalized, e))
}

/// Evaluate an expression, returning every selected value in document order.
pub(crate) fn select(json: &Value, expression: &str) -> Result<Vec<Value>, String> {
    let trimmed = expression.trim();
    if is_shorthand(trimmed) {
        return Ok(walk(json, trimmed));
    }

    let normalized = normalize(trimmed);
    let path = JsonPath::<Value>::try_from(normalized.as_str())
        .map_err(|e| format!("invalid JSON path {}: {}", normalized, e))?;

    Ok(match path.find(json) {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn walk(json: &Value, expression: &str) -> Vec<Value> {
    let mut current = vec![json];
    for segment in expression.split('.').filter(|s| !s.is_empty()) {
        current = current
            .into_iter()
            .flat_map(|value| field(value, segment))
            .collect();
    }
    current.into_iter().cloned().collect()
}

fn field<'a>(value: &'a Value, name: &str) -> Vec<&'a Value> {
    match value {
        Value::Object(fields) => fields.get(name).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(|item| field(item, name)).collect(),
        _ => Vec::new(),
    }
}
