//! Secret redaction applied at the adapter boundary: nothing downstream
//! (telemetry, metrics bus, store, event log) ever sees a raw secret.

/// Replacement written over every secret occurrence.
pub const REDACTED: &str = "[REDACTED]";

/// Substring, case-sensitive redactor over a fixed secret set.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    secrets: Vec<String>,
}

impl SecretRedactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the ambient environment plus configured API keys.
    pub fn from_env(extra_keys: &[String]) -> Self {
        let mut redactor = Self::new();
        if let Ok(token) = std::env::var(crate::agent::AUTH_TOKEN_ENV) {
            redactor.add_secret(&token);
        }
        for key in extra_keys {
            redactor.add_secret(key);
        }
        redactor
    }

    pub fn add_secret(&mut self, secret: &str) {
        // Short strings would redact half the output by accident.
        if secret.len() >= 8 && !self.secrets.iter().any(|s| s == secret) {
            self.secrets.push(secret.to_string());
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}
