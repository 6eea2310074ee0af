//! Request-body rewriting: forcing the google_search tool into Gemini
//! generate requests.
//!
//! The rewriter inspects the prompt text for a trigger word (whole-word,
//! case-insensitive). When the trigger fires, the request's tools are
//! replaced with `google_search` and any `functionDeclarations` are dropped;
//! when it does not, `google_search` is only added if the request declares
//! no functions of its own.

use regex::Regex;
use serde_json::{json, Map, Value};

/// Errors from the body rewriter. Parse failures are not errors: a body that
/// is not a JSON object passes through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("failed to serialize rewritten request body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Rewrites request bodies to carry the google_search tool.
#[derive(Debug, Clone)]
pub struct SearchToolRewriter {
    trigger: Regex,
}

impl SearchToolRewriter {
    /// Build a rewriter for a trigger word. The word is matched whole and
    /// case-insensitively anywhere in the prompt text.
    pub fn new(trigger_word: &str) -> Result<Self, regex::Error> {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(trigger_word));
        Ok(Self {
            trigger: Regex::new(&pattern)?,
        })
    }

    /// Rewrite a request body. Returns the new bytes, or `None` when the
    /// body is left untouched (non-JSON input, or nothing to change).
    pub fn rewrite(&self, body: &[u8]) -> Result<Option<Vec<u8>>, RewriteError> {
        let mut request: Map<String, Value> = match serde_json::from_slice(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("request body is not a JSON object; leaving it unchanged");
                return Ok(None);
            }
        };

        let trigger_found = self.trigger_in_contents(&request);
        if trigger_found {
            tracing::debug!("search trigger word found in request contents");
        }

        if !apply_search_tool(&mut request, trigger_found) {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(&Value::Object(request))?))
    }

    /// Whether any `contents[*].parts[*].text` fragment matches the trigger.
    fn trigger_in_contents(&self, request: &Map<String, Value>) -> bool {
        let Some(contents) = request.get("contents").and_then(Value::as_array) else {
            return false;
        };
        contents
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|content| content.get("parts").and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_object)
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .any(|text| self.trigger.is_match(text))
    }
}

fn google_search_tool() -> Value {
    json!({ "google_search": {} })
}

/// Whether the request's tools carry a `functionDeclarations` entry, in
/// either the array or the object shape.
fn has_function_declarations(tools: &Value) -> bool {
    match tools {
        Value::Array(list) => list
            .iter()
            .filter_map(Value::as_object)
            .any(|tool| tool.contains_key("functionDeclarations")),
        Value::Object(map) => map.contains_key("functionDeclarations"),
        _ => false,
    }
}

/// Apply the tool-injection rules to the parsed request. Returns whether the
/// request was modified.
fn apply_search_tool(request: &mut Map<String, Value>, trigger_found: bool) -> bool {
    let has_declarations = request
        .get("tools")
        .map(has_function_declarations)
        .unwrap_or(false);

    if trigger_found {
        // Force google_search; declared functions are dropped.
        match request.get_mut("tools") {
            Some(Value::Object(map)) => {
                let mut modified = map.remove("functionDeclarations").is_some();
                if !map.contains_key("google_search") {
                    map.insert("google_search".to_string(), json!({}));
                    modified = true;
                }
                modified
            }
            Some(other) => {
                *other = Value::Array(vec![google_search_tool()]);
                true
            }
            None => {
                request.insert("tools".to_string(), Value::Array(vec![google_search_tool()]));
                true
            }
        }
    } else if has_declarations {
        // The request brings its own functions; leave tools alone.
        false
    } else {
        match request.get_mut("tools") {
            Some(Value::Array(list)) => {
                let present = list
                    .iter()
                    .filter_map(Value::as_object)
                    .any(|tool| tool.contains_key("google_search"));
                if present {
                    false
                } else {
                    list.push(google_search_tool());
                    true
                }
            }
            Some(Value::Object(map)) => {
                if map.contains_key("google_search") {
                    false
                } else {
                    map.insert("google_search".to_string(), json!({}));
                    true
                }
            }
            Some(other) => {
                *other = Value::Array(vec![google_search_tool()]);
                true
            }
            None => {
                request.insert("tools".to_string(), Value::Array(vec![google_search_tool()]));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> SearchToolRewriter {
        SearchToolRewriter::new("search").unwrap()
    }

    fn rewrite_json(input: &str) -> Option<Value> {
        rewriter()
            .rewrite(input.as_bytes())
            .unwrap()
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_non_json_body_is_identity() {
        assert!(rewriter().rewrite(b"not json").unwrap().is_none());
    }

    #[test]
    fn test_non_object_json_is_identity() {
        assert!(rewriter().rewrite(b"[1, 2, 3]").unwrap().is_none());
    }

    #[test]
    fn test_no_trigger_no_tools_appends_google_search() {
        let out = rewrite_json(r#"{"contents": [{"parts": [{"text": "hello world"}]}]}"#).unwrap();
        assert_eq!(out["tools"], json!([{ "google_search": {} }]));
    }

    #[test]
    fn test_no_trigger_appends_to_existing_tools_array() {
        let out = rewrite_json(r#"{"contents": [], "tools": [{"some_other_tool": {}}]}"#).unwrap();
        assert_eq!(
            out["tools"],
            json!([{ "some_other_tool": {} }, { "google_search": {} }])
        );
    }

    #[test]
    fn test_no_trigger_google_search_already_present_is_identity() {
        let input = r#"{"contents": [], "tools": [{"google_search": {}}]}"#;
        assert!(rewriter().rewrite(input.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_no_trigger_function_declarations_left_alone() {
        let input =
            r#"{"contents": [], "tools": [{"functionDeclarations": [{"name": "find_theaters"}]}]}"#;
        assert!(rewriter().rewrite(input.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_trigger_is_case_insensitive_whole_word() {
        let out = rewrite_json(
            r#"{"contents": [{"parts": [{"text": "Please SeArCh the web."}]}]}"#,
        )
        .unwrap();
        assert_eq!(out["tools"], json!([{ "google_search": {} }]));
    }

    #[test]
    fn test_trigger_replaces_function_declarations_array() {
        let out = rewrite_json(
            r#"{"contents": [{"parts": [{"text": "search now"}]}], "tools": [{"functionDeclarations": [{"name": "find_theaters"}]}]}"#,
        )
        .unwrap();
        assert_eq!(out["tools"], json!([{ "google_search": {} }]));
    }

    #[test]
    fn test_trigger_rewrites_tools_map_in_place() {
        let out = rewrite_json(
            r#"{"contents": [{"parts": [{"text": "search now"}]}], "tools": {"functionDeclarations": [{"name": "find_theaters"}], "other_stuff": 1}}"#,
        )
        .unwrap();
        assert_eq!(out["tools"], json!({ "google_search": {}, "other_stuff": 1 }));
    }

    #[test]
    fn test_trigger_adds_to_tools_map_without_declarations() {
        let out = rewrite_json(
            r#"{"contents": [{"parts": [{"text": "search now"}]}], "tools": {"other_stuff": 1}}"#,
        )
        .unwrap();
        assert_eq!(out["tools"], json!({ "google_search": {}, "other_stuff": 1 }));
    }

    #[test]
    fn test_substring_does_not_trigger() {
        // "researching" contains the trigger but not as a whole word, so the
        // declarations survive.
        let input = r#"{"contents": [{"parts": [{"text": "researching this topic"}]}], "tools": [{"functionDeclarations": []}]}"#;
        assert!(rewriter().rewrite(input.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_trigger_in_later_content_entry() {
        let out = rewrite_json(
            r#"{"contents": [{"parts": [{"text": "hello"}]}, {"parts": [{"text": "now search it"}]}], "tools": [{"functionDeclarations": []}]}"#,
        )
        .unwrap();
        assert_eq!(out["tools"], json!([{ "google_search": {} }]));
    }

    #[test]
    fn test_trigger_with_regex_metacharacters_is_literal() {
        let rewriter = SearchToolRewriter::new("node.js").unwrap();

        // The dot is escaped, so "nodexjs" must not fire the trigger.
        let miss = br#"{"contents": [{"parts": [{"text": "deploy nodexjs fast"}]}], "tools": [{"functionDeclarations": []}]}"#;
        assert!(rewriter.rewrite(miss).unwrap().is_none());

        let hit = br#"{"contents": [{"parts": [{"text": "deploy node.js fast"}]}], "tools": [{"functionDeclarations": []}]}"#;
        let out: Value =
            serde_json::from_slice(&rewriter.rewrite(hit).unwrap().unwrap()).unwrap();
        assert_eq!(out["tools"], json!([{ "google_search": {} }]));
    }

    #[test]
    fn test_other_fields_survive_rewrite() {
        let out = rewrite_json(
            r#"{"model": "gemini-pro", "contents": [{"parts": [{"text": "hi"}]}], "generationConfig": {"temperature": 0.5}}"#,
        )
        .unwrap();
        assert_eq!(out["model"], "gemini-pro");
        assert_eq!(out["generationConfig"]["temperature"], 0.5);
        assert_eq!(out["contents"][0]["parts"][0]["text"], "hi");
    }
}
