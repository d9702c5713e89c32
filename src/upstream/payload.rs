//! Interpretation of the aggregator's irregular response envelopes.
//!
//! Depending on source and request type the useful value may be a bare
//! string, an object with a `url`, an object nesting everything under
//! `data`, or an array of entries. [`UpstreamPayload`] names those shapes
//! and the extractors walk them depth first.

use serde_json::{Map, Value};

use super::error::{UpstreamError, UpstreamResult};

/// The response shapes the upstream is known to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPayload {
    /// A bare string, sometimes the URL itself
    Text(String),
    /// An object carrying a `url` field
    WithUrl { url: String, rest: Map<String, Value> },
    /// An object whose content lives under `data`
    WithData {
        data: Box<UpstreamPayload>,
        rest: Map<String, Value>,
    },
    /// A list of entries
    Entries(Vec<UpstreamPayload>),
    /// Anything else: other objects, numbers, booleans, null
    Other(Value),
}

impl UpstreamPayload {
    /// Parse a raw response body, unwrapping a JSONP callback if present.
    pub fn parse(body: &str) -> UpstreamResult<Self> {
        let json = unwrap_jsonp(body);
        let value: Value = serde_json::from_str(json).map_err(|e| {
            let preview: String = body.chars().take(120).collect();
            UpstreamError::Parse(format!("{} (body starts with {:?})", e, preview))
        })?;
        Ok(Self::from(value))
    }

    /// Depth-first search for the first string that looks like a URL.
    pub fn first_url(&self) -> Option<String> {
        match self {
            UpstreamPayload::Text(text) => looks_like_url(text).then(|| normalize_url(text)),
            UpstreamPayload::WithUrl { url, rest } => {
                if looks_like_url(url) {
                    Some(normalize_url(url))
                } else {
                    first_url_in_value_map(rest)
                }
            }
            UpstreamPayload::WithData { data, rest } => {
                data.first_url().or_else(|| first_url_in_value_map(rest))
            }
            UpstreamPayload::Entries(entries) => entries.iter().find_map(Self::first_url),
            UpstreamPayload::Other(value) => first_url_in_value(value),
        }
    }

    /// Depth-first search for the first non-empty string stored under `key`.
    pub fn first_text_field(&self, key: &str) -> Option<String> {
        match self {
            UpstreamPayload::Text(_) => None,
            UpstreamPayload::WithUrl { rest, .. } => text_field_in_map(rest, key),
            UpstreamPayload::WithData { data, rest } => text_field_in_map(rest, key)
                .or_else(|| data.first_text_field(key)),
            UpstreamPayload::Entries(entries) => {
                entries.iter().find_map(|e| e.first_text_field(key))
            }
            UpstreamPayload::Other(value) => text_field_in_value(value, key),
        }
    }

    /// The list of entries, looking through a `data` wrapper.
    ///
    /// A single object is treated as a one-element list.
    pub fn entries(&self) -> Vec<Value> {
        match self {
            UpstreamPayload::Entries(entries) => entries.iter().map(Self::to_value).collect(),
            UpstreamPayload::WithData { data, .. } => data.entries(),
            UpstreamPayload::Other(Value::Object(map)) => vec![Value::Object(map.clone())],
            UpstreamPayload::WithUrl { .. } => vec![self.to_value()],
            _ => Vec::new(),
        }
    }

    /// Convert back into a plain JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            UpstreamPayload::Text(text) => Value::String(text.clone()),
            UpstreamPayload::WithUrl { url, rest } => {
                let mut map = rest.clone();
                map.insert("url".to_string(), Value::String(url.clone()));
                Value::Object(map)
            }
            UpstreamPayload::WithData { data, rest } => {
                let mut map = rest.clone();
                map.insert("data".to_string(), data.to_value());
                Value::Object(map)
            }
            UpstreamPayload::Entries(entries) => {
                Value::Array(entries.iter().map(Self::to_value).collect())
            }
            UpstreamPayload::Other(value) => value.clone(),
        }
    }
}

impl From<Value> for UpstreamPayload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => UpstreamPayload::Text(text),
            Value::Array(items) => {
                UpstreamPayload::Entries(items.into_iter().map(UpstreamPayload::from).collect())
            }
            Value::Object(mut map) => {
                if let Some(Value::String(url)) = map.get("url") {
                    let url = url.clone();
                    map.remove("url");
                    return UpstreamPayload::WithUrl { url, rest: map };
                }
                if let Some(data) = map.remove("data") {
                    if !data.is_null() {
                        return UpstreamPayload::WithData {
                            data: Box::new(UpstreamPayload::from(data)),
                            rest: map,
                        };
                    }
                }
                UpstreamPayload::Other(Value::Object(map))
            }
            other => UpstreamPayload::Other(other),
        }
    }
}

/// Strip a `callback( ... )` wrapper by locating the outermost parentheses.
///
/// Bodies without a wrapper, or whose first significant character already
/// starts JSON, are returned trimmed.
pub fn unwrap_jsonp(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed.starts_with('"') {
        return trimmed;
    }
    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => trimmed[open + 1..close].trim(),
        _ => trimmed,
    }
}

fn looks_like_url(text: &str) -> bool {
    let text = text.trim();
    text.starts_with("http://") || text.starts_with("https://") || text.starts_with("//")
}

fn normalize_url(text: &str) -> String {
    let text = text.trim();
    match text.strip_prefix("//") {
        Some(rest) => format!("https://{}", rest),
        None => text.to_string(),
    }
}

fn first_url_in_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => looks_like_url(text).then(|| normalize_url(text)),
        Value::Array(items) => items.iter().find_map(first_url_in_value),
        Value::Object(map) => first_url_in_value_map(map),
        _ => None,
    }
}

fn first_url_in_value_map(map: &Map<String, Value>) -> Option<String> {
    // Prefer an explicit `url` key before walking siblings.
    if let Some(url) = map.get("url").and_then(first_url_in_value) {
        return Some(url);
    }
    map.values().find_map(first_url_in_value)
}

fn text_field_in_map(map: &Map<String, Value>, key: &str) -> Option<String> {
    if let Some(Value::String(text)) = map.get(key) {
        if !text.trim().is_empty() {
            return Some(text.clone());
        }
    }
    map.values().find_map(|v| text_field_in_value(v, key))
}

fn text_field_in_value(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => text_field_in_map(map, key),
        Value::Array(items) => items.iter().find_map(|v| text_field_in_value(v, key)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_jsonp() {
        assert_eq!(unwrap_jsonp(r#"jQuery123({"url":"x"})"#), r#"{"url":"x"}"#);
        assert_eq!(unwrap_jsonp(" cb( [1, 2] ) ;"), "[1, 2]");
        assert_eq!(unwrap_jsonp(r#"{"a":"(b)"}"#), r#"{"a":"(b)"}"#);
        // Nested parentheses inside the JSON survive.
        assert_eq!(unwrap_jsonp(r#"cb({"t":"Song (Live)"})"#), r#"{"t":"Song (Live)"}"#);
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(
            UpstreamPayload::parse("<html>Just a moment...</html>"),
            Err(UpstreamError::Parse(_))
        ));
    }

    #[test]
    fn test_shapes() {
        assert!(matches!(
            UpstreamPayload::from(json!("https://a")),
            UpstreamPayload::Text(_)
        ));
        assert!(matches!(
            UpstreamPayload::from(json!({"url": "https://a", "br": 320})),
            UpstreamPayload::WithUrl { .. }
        ));
        assert!(matches!(
            UpstreamPayload::from(json!({"data": {"url": "https://a"}})),
            UpstreamPayload::WithData { .. }
        ));
        assert!(matches!(
            UpstreamPayload::from(json!([{"id": 1}])),
            UpstreamPayload::Entries(_)
        ));
        assert!(matches!(
            UpstreamPayload::from(json!({"data": null, "code": 200})),
            UpstreamPayload::Other(_)
        ));
    }

    #[test]
    fn test_first_url_walks_every_shape() {
        let cases = [
            json!("https://cdn.example/a.mp3"),
            json!({"url": "https://cdn.example/a.mp3", "br": 320}),
            json!({"code": 200, "data": {"url": "https://cdn.example/a.mp3"}}),
            json!({"data": [{"id": 1, "url": ""}, {"url": "https://cdn.example/a.mp3"}]}),
            json!([{"info": {"link": "https://cdn.example/a.mp3"}}]),
            json!({"url": "", "backup": "//cdn.example/a.mp3"}),
        ];
        for case in cases {
            let payload = UpstreamPayload::from(case.clone());
            let url = payload.first_url();
            assert!(
                url.as_deref().is_some_and(|u| u.ends_with("cdn.example/a.mp3")
                    && u.starts_with("https://")),
                "no url in {}",
                case
            );
        }
    }

    #[test]
    fn test_first_url_none_when_absent() {
        let payload = UpstreamPayload::from(json!({"data": {"url": "", "size": 0}}));
        assert_eq!(payload.first_url(), None);
        assert_eq!(UpstreamPayload::from(json!("not a url")).first_url(), None);
    }

    #[test]
    fn test_first_text_field() {
        let payload = UpstreamPayload::from(json!({"data": {"lyric": "[00:01]hi", "tlyric": ""}}));
        assert_eq!(payload.first_text_field("lyric").as_deref(), Some("[00:01]hi"));
        assert_eq!(payload.first_text_field("tlyric"), None);
    }

    #[test]
    fn test_entries_through_data() {
        let payload = UpstreamPayload::from(json!({"data": [{"id": 1}, {"id": 2}]}));
        assert_eq!(payload.entries().len(), 2);
        let single = UpstreamPayload::from(json!({"id": 1, "name": "x"}));
        assert_eq!(single.entries().len(), 1);
        assert!(UpstreamPayload::from(json!(3)).entries().is_empty());
    }
}
