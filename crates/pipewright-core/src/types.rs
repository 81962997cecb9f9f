use serde::{Deserialize, Serialize};

/// Shape the caller expects back from the collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// Options accompanying a single collaborator call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOptions {
    #[serde(default)]
    pub expected_format: ExpectedFormat,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            expected_format: ExpectedFormat::Text,
            max_output_size: default_max_output_size(),
            temperature: 0.0,
        }
    }
}

impl InvokeOptions {
    pub fn with_format(mut self, format: ExpectedFormat) -> Self {
        self.expected_format = format;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_size(mut self, size: u32) -> Self {
        self.max_output_size = size;
        self
    }
}

pub(crate) fn default_max_output_size() -> u32 {
    4096
}

/// What the collaborator sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Text(String),
    Structured(serde_json::Value),
}

impl Reply {
    /// The reply as text. Structured replies are rendered as compact JSON.
    pub fn text(&self) -> String {
        match self {
            Reply::Text(s) => s.clone(),
            Reply::Structured(v) => v.to_string(),
        }
    }

    /// The reply as a structured value.
    ///
    /// Text replies are parsed as YAML (a superset of JSON), after stripping
    /// a surrounding fenced code block if one is present.
    pub fn into_structured(self) -> crate::error::Result<serde_json::Value> {
        match self {
            Reply::Structured(v) => Ok(v),
            Reply::Text(s) => {
                let body = strip_code_fence(&s);
                serde_yaml_ng::from_str(body)
                    .map_err(|e| crate::error::FlowError::CollaboratorParse(e.to_string()))
            }
        }
    }
}

/// Remove a ```yaml / ```json fence around a reply body, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
