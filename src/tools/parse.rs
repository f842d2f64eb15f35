use serde_json::Value;

/// Remove a surrounding markdown code fence (```lang ... ```), if any.
pub fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    // Skip first line (```json) and the closing fence when present
    let end = if lines.len() > 1 && lines[lines.len() - 1].trim_start().starts_with("```") {
        lines.len() - 1
    } else {
        lines.len()
    };
    lines[1.min(end)..end].join("\n")
}

/// Pull the first JSON object out of a free-form model response.
pub fn extract_json(response: &str) -> Option<Value> {
    let body = strip_code_fences(response);
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        return Some(value);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&body[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_block() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(strip_code_fences("  hello \n"), "hello");
    }

    #[test]
    fn unterminated_fence_does_not_panic() {
        assert_eq!(strip_code_fences("```"), "");
        assert_eq!(strip_code_fences("```rust\nfn main() {}"), "fn main() {}");
    }

    #[test]
    fn extracts_object_embedded_in_prose() {
        let raw = "Here you go:\n{\"files\": [{\"path\": \"a.py\"}]}\nThanks!";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["files"][0]["path"], "a.py");
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json("nothing here").is_none());
    }
}
