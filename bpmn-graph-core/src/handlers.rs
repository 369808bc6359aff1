//! Topic Handler Registry (design §4.4, "C4").
//!
//! Two handler kinds: in-process `Function` closures and declarative `Http`
//! descriptors. Grounded on `bpmn-lite-server`'s handler-dispatch pattern
//! (topic name → registered callback), generalized from a single bytecode
//! `CALL` instruction target to the richer HTTP descriptor §4.4 specifies
//! (template substitution, timeout, retries, sync/async).

use crate::error::{EngineError, EngineResult};
use crate::types::{VarValue, Variables};
use reqwest::Client;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type FunctionHandler =
    Arc<dyn Fn(Variables) -> Pin<Box<dyn Future<Output = EngineResult<Variables>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct HttpHandlerSpec {
    pub method: String,
    /// `${var}` placeholders substituted from the instance's variables.
    pub url_template: String,
    pub headers: HashMap<String, String>,
    pub body_template: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    /// If true, the caller (executor) does not wait for the response before
    /// taking the outgoing flow (§4.4's async execution contract).
    pub async_execution: bool,
    /// Dotted/bracket path (`"data.result[0]"`) to the object within the
    /// response body that holds the output variables. `None` means the
    /// whole body is that object.
    pub response_path: Option<String>,
}

#[derive(Clone)]
pub enum Handler {
    Function(FunctionHandler),
    Http(HttpHandlerSpec),
}

/// Registry of topic name -> handler, shared across all instances (design
/// §9: "global mutable state policy" — handlers are registered once and
/// treated as immutable after that, like frozen config).
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<std::sync::RwLock<HashMap<String, Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: impl Into<String>, handler: Handler) {
        self.handlers.write().unwrap().insert(topic.into(), handler);
    }

    pub fn unregister(&self, topic: &str) {
        self.handlers.write().unwrap().remove(topic);
    }

    pub fn get(&self, topic: &str) -> Option<Handler> {
        self.handlers.read().unwrap().get(topic).cloned()
    }

    /// `testTopic` (§6.1): invoke a handler against caller-supplied variables
    /// without an instance/token ever existing, returning the output
    /// variables (or the error) directly.
    pub async fn test(&self, topic: &str, input: Variables) -> EngineResult<Variables> {
        let handler = self.get(topic).ok_or_else(|| EngineError::HandlerConfig {
            topic: topic.to_string(),
            message: "no handler registered".to_string(),
        })?;
        invoke(topic, &handler, input).await
    }
}

/// Invoke a handler to completion, applying HTTP timeout/retry policy.
pub async fn invoke(topic: &str, handler: &Handler, input: Variables) -> EngineResult<Variables> {
    match handler {
        Handler::Function(f) => f(input).await,
        Handler::Http(spec) => invoke_http(topic, spec, input).await,
    }
}

async fn invoke_http(topic: &str, spec: &HttpHandlerSpec, input: Variables) -> EngineResult<Variables> {
    let client = Client::new();
    let timeout = Duration::from_millis(spec.timeout_ms.unwrap_or(30_000));
    let max_retries = spec.max_retries.unwrap_or(0);

    let url = substitute_template(&spec.url_template, &input);
    let body = spec.body_template.as_ref().map(|t| substitute_template(t, &input));

    let method = spec
        .method
        .parse::<reqwest::Method>()
        .map_err(|e| EngineError::HandlerConfig {
            topic: topic.to_string(),
            message: format!("invalid HTTP method '{}': {e}", spec.method),
        })?;

    let mut attempt = 0;
    loop {
        let mut req = client.request(method.clone(), &url).timeout(timeout);
        for (k, v) in &spec.headers {
            req = req.header(k, substitute_template(v, &input));
        }
        if let Some(body) = &body {
            req = req.body(body.clone());
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                let text = resp.text().await.unwrap_or_default();
                return parse_response_variables(topic, &text, spec.response_path.as_deref());
            }
            Ok(resp) if resp.status().is_server_error() && attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
            Ok(resp) => {
                return Err(EngineError::HandlerFatal {
                    topic: topic.to_string(),
                    message: format!("HTTP handler returned status {}", resp.status()),
                });
            }
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
            Err(e) => {
                return Err(EngineError::HandlerTransient {
                    topic: topic.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Exponential backoff capped at 2s, doubling from a 100ms base per retry.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(millis.min(2_000))
}

/// Replace `${name}` with the variable's string form; unknown names are left
/// untouched (the handler config error surfaces when the remote call fails).
fn substitute_template(template: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        if let Some(end) = rest.find('}') {
            let name = &rest[..end];
            if let Some(value) = vars.get(name) {
                out.push_str(&var_value_to_string(value));
            } else {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
            rest = &rest[end + 1..];
        } else {
            out.push_str("${");
            break;
        }
    }
    out.push_str(rest);
    out
}

fn var_value_to_string(v: &VarValue) -> String {
    match v {
        VarValue::String(s) => s.clone(),
        VarValue::Integer(n) => n.to_string(),
        VarValue::Decimal(d) => d.to_string(),
        VarValue::Boolean(b) => b.to_string(),
        VarValue::DateTime(ts) => crate::types::to_iso8601(*ts),
    }
}

/// Response bodies are a flat JSON object of `{name: value}`, typed by JSON
/// shape (number → Decimal/Integer, bool → Boolean, string → String). If
/// `response_path` is set, that object lives nested inside the body and is
/// located first via `json_path_get`.
fn parse_response_variables(topic: &str, body: &str, response_path: Option<&str>) -> EngineResult<Variables> {
    if body.trim().is_empty() {
        return Ok(Variables::new());
    }
    let parsed: serde_json::Value =
        serde_json::from_str(body).map_err(|e| EngineError::HandlerFatal {
            topic: topic.to_string(),
            message: format!("handler response is not valid JSON: {e}"),
        })?;
    let target = match response_path {
        Some(path) => json_path_get(&parsed, path).ok_or_else(|| EngineError::HandlerFatal {
            topic: topic.to_string(),
            message: format!("response_path '{path}' not found in handler response"),
        })?,
        None => &parsed,
    };
    let obj = target.as_object().ok_or_else(|| EngineError::HandlerFatal {
        topic: topic.to_string(),
        message: "handler response must resolve to a JSON object".to_string(),
    })?;
    let mut out = Variables::new();
    for (k, v) in obj {
        out.insert(k.clone(), json_to_var_value(v));
    }
    Ok(out)
}

/// Minimal dotted/bracket JSON path walker: `"data.items[0].name"` ->
/// `root["data"]["items"][0]["name"]`. Returns `None` on any missing key,
/// out-of-range index, or type mismatch along the way.
fn json_path_get<'v>(root: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_bracket_indices(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Split `"items[0][1]"` into (`"items"`, `[0, 1]`).
fn split_bracket_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(first_bracket) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let key = &segment[..first_bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[first_bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(end) = stripped.find(']') else { break };
        if let Ok(idx) = stripped[..end].parse() {
            indices.push(idx);
        }
        rest = &stripped[end + 1..];
    }
    (key, indices)
}

fn json_to_var_value(v: &serde_json::Value) -> VarValue {
    match v {
        serde_json::Value::Bool(b) => VarValue::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                VarValue::Integer(i)
            } else {
                VarValue::Decimal(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => VarValue::String(s.clone()),
        other => VarValue::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution_replaces_known_vars() {
        let mut vars = Variables::new();
        vars.insert("amount".to_string(), VarValue::Integer(42));
        let out = substitute_template("https://x/y?amount=${amount}&missing=${nope}", &vars);
        assert_eq!(out, "https://x/y?amount=42&missing=${nope}");
    }

    #[test]
    fn json_path_walks_dotted_and_bracketed_segments() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{"data":{"items":[{"name":"a"},{"name":"b"}]}}"#,
        )
        .unwrap();
        let found = json_path_get(&body, "data.items[1]").unwrap();
        assert_eq!(found, &serde_json::json!({"name": "b"}));
        assert!(json_path_get(&body, "data.items[5]").is_none());
        assert!(json_path_get(&body, "data.missing").is_none());
    }

    #[test]
    fn parse_response_variables_extracts_via_response_path() {
        let body = r#"{"meta":{"ok":true},"result":{"x":42,"label":"done"}}"#;
        let vars = parse_response_variables("topic", body, Some("result")).unwrap();
        assert_eq!(vars.get("x"), Some(&VarValue::Integer(42)));
        assert_eq!(vars.get("label"), Some(&VarValue::String("done".to_string())));
    }

    #[tokio::test]
    async fn function_handler_invokes_closure() {
        let handler: FunctionHandler = Arc::new(|mut vars: Variables| {
            Box::pin(async move {
                vars.insert("doubled".to_string(), VarValue::Integer(2));
                Ok(vars)
            })
        });
        let registry = HandlerRegistry::new();
        registry.register("double", Handler::Function(handler));
        let out = registry.test("double", Variables::new()).await.unwrap();
        assert_eq!(out.get("doubled"), Some(&VarValue::Integer(2)));
    }
}
