use std::time::Duration;

use serde_json::{Value, json};
use ureq::Agent;

use crate::agent::{Payload, payload};
use crate::tools::parse::extract_json;
use crate::tools::{Tool, ToolError, arg_str, arg_str_or, skipped};

/// Send a POST request with a JSON body and return the response body.
pub fn http_post_json(
    url: &str,
    body: &Value,
    bearer: Option<&str>,
    timeout: Duration,
) -> Result<String, ureq::Error> {
    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();

    let agent: Agent = config.into();

    let mut request = agent.post(url);
    if let Some(token) = bearer {
        request = request.header("Authorization", &format!("Bearer {token}"));
    }
    request.send_json(body)?.body_mut().read_to_string()
}

/// Asks a code-generation endpoint for project files.
///
/// Args: `prompt`, `instructions`, `model`. On success returns
/// `{status: "ok", files: [{path, contents}, ...]}`. Offline, or without a
/// configured endpoint, returns `skipped`. Transport and parse failures come
/// back as `status: "error"` so the calling stage can fall back.
pub struct CodeSynthesis {
    endpoint: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    offline: bool,
}

impl CodeSynthesis {
    pub fn new(
        endpoint: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
        offline: bool,
    ) -> Self {
        Self {
            endpoint,
            api_key,
            timeout,
            offline,
        }
    }
}

impl Tool for CodeSynthesis {
    fn name(&self) -> &str {
        "code_synthesis"
    }

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
        if self.offline {
            return Ok(skipped(self.name(), "offline"));
        }
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Ok(skipped(self.name(), "no endpoint configured"));
        };

        let body = json!({
            "model": arg_str_or(args, "model", "default"),
            "instructions": arg_str_or(args, "instructions", ""),
            "input": arg_str(args, "prompt")?,
        });

        let raw = match http_post_json(endpoint, &body, self.api_key.as_deref(), self.timeout) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(endpoint, error = %err, "code synthesis request failed");
                return Ok(payload(json!({
                    "status": "error",
                    "error": err.to_string(),
                })));
            }
        };

        let files = extract_json(&raw)
            .and_then(|v| v.get("files").cloned())
            .filter(Value::is_array);

        Ok(match files {
            Some(files) => payload(json!({ "status": "ok", "files": files })),
            None => payload(json!({
                "status": "error",
                "error": "response did not contain a files array",
            })),
        })
    }
}
