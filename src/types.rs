//! Inbound request and response types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller identity used when a request does not name one.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Free-form decoding parameters (temperature, max_tokens, ...).
///
/// Stored as a JSON object so adapters can forward keys they understand
/// and the cache can fingerprint them canonically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationParams(Map<String, Value>);

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse parameters from a JSON object string.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Map<String, Value>>(s).map(Self)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `max_tokens` when present and representable as a token count.
    pub fn max_tokens(&self) -> Option<u32> {
        let value = self.0.get("max_tokens")?;
        let n = match value.as_u64() {
            Some(n) => n,
            None => {
                let f = value.as_f64()?;
                if f < 0.0 || f.fract() != 0.0 {
                    return None;
                }
                f as u64
            }
        };
        u32::try_from(n).ok()
    }
}

impl From<Map<String, Value>> for GenerationParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A generation request against a logical model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Logical model name. Providers map it to their own upstream model id.
    pub model: String,
    #[serde(default = "default_caller")]
    pub caller: String,
    #[serde(default)]
    pub params: GenerationParams,
}

fn default_caller() -> String {
    ANONYMOUS_CALLER.to_string()
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            caller: default_caller(),
            params: GenerationParams::default(),
        }
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// Result of a successful `generate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub provider_used: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost charged for this call. Zero on a cache hit.
    pub cost: f64,
    pub cache_hit: bool,
}
