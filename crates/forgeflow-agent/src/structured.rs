use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Expected JSON kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn json_type(&self) -> Option<&'static str> {
        match self {
            FieldKind::String => Some("string"),
            FieldKind::Number => Some("number"),
            FieldKind::Bool => Some("boolean"),
            FieldKind::Array => Some("array"),
            FieldKind::Object => Some("object"),
            FieldKind::Any => None,
        }
    }
}

/// Minimal per-agent output schema: a list of required top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub required: Vec<(String, FieldKind)>,
}

impl OutputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.required.push((name.to_string(), kind));
        self
    }

    /// JSON-schema rendering used as the provider hint.
    pub fn to_json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        for (name, kind) in &self.required {
            let prop = match kind.json_type() {
                Some(t) => serde_json::json!({ "type": t }),
                None => serde_json::json!({}),
            };
            properties.insert(name.clone(), prop);
        }
        let required: Vec<&str> = self.required.iter().map(|(n, _)| n.as_str()).collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Return every violation of this schema found in `value`.
    pub fn validate(&self, value: &serde_json::Value) -> Vec<String> {
        let Some(obj) = value.as_object() else {
            return vec!["expected a JSON object".to_string()];
        };
        self.required
            .iter()
            .filter_map(|(name, kind)| match obj.get(name) {
                None => Some(format!("missing field '{name}'")),
                Some(v) if !kind.matches(v) => Some(format!(
                    "field '{name}' should be {}",
                    kind.json_type().unwrap_or("any")
                )),
                Some(_) => None,
            })
            .collect()
    }
}

/// Outcome of parsing a response against an [`OutputSchema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StructuredStatus {
    Valid,
    /// JSON was found but failed validation; the value is still usable.
    Invalid { errors: Vec<String> },
    /// No JSON at all; the value is `{"raw": text}`.
    Unparsed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub value: serde_json::Value,
    pub status: StructuredStatus,
}

impl StructuredOutput {
    pub fn is_valid(&self) -> bool {
        self.status == StructuredStatus::Valid
    }
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

/// Extract the first JSON object from a model response.
///
/// Fenced ```json blocks win; then unlabeled fenced blocks that parse; then
/// the first balanced top-level `{...}` literal in the text.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let fences: Vec<(String, String)> = fence_regex()
        .map(|re| {
            re.captures_iter(text)
                .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
                .collect()
        })
        .unwrap_or_default();

    for (lang, body) in &fences {
        if lang == "json" {
            if let Ok(v) = serde_json::from_str(body.trim()) {
                return Some(v);
            }
        }
    }
    for (lang, body) in &fences {
        if lang.is_empty() {
            if let Ok(v) = serde_json::from_str(body.trim()) {
                return Some(v);
            }
        }
    }

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_object_end(&text[start..]) {
            if let Ok(v) = serde_json::from_str(&text[start..start + end]) {
                return Some(v);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the balanced `{...}` prefix of `s`, string/escape aware.
fn balanced_object_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse `text` against `schema`; never fails.
pub fn parse_structured(text: &str, schema: &OutputSchema) -> StructuredOutput {
    match extract_json(text) {
        Some(value) => {
            let errors = schema.validate(&value);
            let status = if errors.is_empty() {
                StructuredStatus::Valid
            } else {
                StructuredStatus::Invalid { errors }
            };
            StructuredOutput { value, status }
        }
        None => StructuredOutput {
            value: serde_json::json!({ "raw": text }),
            status: StructuredStatus::Unparsed,
        },
    }
}
