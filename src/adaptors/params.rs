use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::AdaptorError;

/// Key/value initialization parameters of one adaptor configuration.
///
/// Adaptors take the keys they know; whatever is left when [`finish`](Self::finish)
/// is called is an unexpected parameter.
#[derive(Debug, Default, Clone)]
pub struct InitParams {
    values: BTreeMap<String, String>,
}

impl InitParams {
    pub fn from_toml(params: &BTreeMap<String, toml::Value>) -> Result<Self, AdaptorError> {
        let mut values = BTreeMap::new();
        for (key, value) in params {
            let rendered = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(AdaptorError::Init(format!(
                        "parameter '{key}' must be a scalar, got {}",
                        other.type_str()
                    )));
                }
            };
            values.insert(key.clone(), rendered);
        }
        Ok(Self { values })
    }

    #[cfg(test)]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Takes a mandatory, non-empty parameter.
    pub fn required(&mut self, key: &str) -> Result<String, AdaptorError> {
        self.optional(key)
            .ok_or_else(|| AdaptorError::Init(format!("missing parameter '{key}'")))
    }

    /// Takes a parameter; empty values count as missing.
    pub fn optional(&mut self, key: &str) -> Option<String> {
        self.values
            .remove(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn or(&mut self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    pub fn parse_or<T: FromStr>(&mut self, key: &str, default: T) -> Result<T, AdaptorError> {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| AdaptorError::Init(format!("parameter '{key}': invalid value '{raw}'"))),
            None => Ok(default),
        }
    }

    /// Rejects parameters no adaptor step consumed.
    pub fn finish(self) -> Result<(), AdaptorError> {
        match self.values.keys().next() {
            Some(key) => Err(AdaptorError::UnexpectedParam(key.clone())),
            None => Ok(()),
        }
    }
}

/// Hides credentials when an adaptor configuration is dumped.
pub fn redact(key: &str, value: &str) -> String {
    let secret = ["pass", "key", "token", "secret"]
        .iter()
        .any(|s| key.contains(s))
        && !key.ends_with("private_key");
    if secret && !value.is_empty() {
        "********".to_string()
    } else {
        value.to_string()
    }
}
