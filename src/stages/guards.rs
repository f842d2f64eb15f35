use std::path::Path;

use serde_json::Value;

use crate::agent::Payload;
use crate::guardrail::{Guardrail, Verdict, guardrail};

fn count(payload: &Payload, key: &str) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// The spec is already loaded, or its path points at a readable file.
pub fn spec_available() -> impl Guardrail {
    guardrail("spec_available", |input, _| {
        if input.get("spec_loaded").and_then(Value::as_bool) == Some(true) {
            return Verdict::pass();
        }
        let path = input.get("spec_path").and_then(Value::as_str).unwrap_or("");
        if path.is_empty() {
            Verdict::fail(["spec_path is empty"])
        } else if !Path::new(path).is_file() {
            Verdict::fail([format!("spec not found at {path}")])
        } else {
            Verdict::pass()
        }
    })
}

pub fn requirements_extracted() -> impl Guardrail {
    guardrail("requirements_extracted", |_, output| {
        match output.map(|o| count(o, "requirements_count")) {
            Some(n) if n > 0 => Verdict::pass(),
            _ => Verdict::fail(["no requirements extracted"]),
        }
    })
}

pub fn files_generated() -> impl Guardrail {
    guardrail("files_generated", |_, output| {
        match output.map(|o| count(o, "files_generated")) {
            Some(n) if n > 0 => Verdict::pass(),
            _ => Verdict::fail(["code generation produced no files"]),
        }
    })
}

pub fn project_files_present() -> impl Guardrail {
    guardrail("project_files_present", |input, _| {
        let present = input
            .get("project_files")
            .and_then(Value::as_array)
            .is_some_and(|files| !files.is_empty());
        if present {
            Verdict::pass()
        } else {
            Verdict::fail(["no project files to test"])
        }
    })
}
