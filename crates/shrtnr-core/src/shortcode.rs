use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A validated short code identifier for a shortened URL.
///
/// Short codes must be 1-32 characters long and contain only
/// alphanumeric characters, hyphens, or underscores. Generated codes
/// are always eight alphanumeric characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortCode(String);

const MIN_LENGTH: usize = 1;
const MAX_LENGTH: usize = 32;

impl ShortCode {
    /// Creates a new `ShortCode` after validating the input.
    pub fn new(code: impl Into<String>) -> std::result::Result<Self, StorageError> {
        let code = code.into();
        Self::validate(&code)?;
        Ok(Self(code))
    }

    /// Creates a `ShortCode` without validation.
    ///
    /// Use this only for codes produced by trusted internal sources
    /// (generators, rows read back from a store).
    pub fn new_unchecked(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Generates the full shortened URL based on the provided base URL.
    pub fn to_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.0)
    }

    /// Returns the short code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn validate(code: &str) -> std::result::Result<(), StorageError> {
        if code.len() < MIN_LENGTH || code.len() > MAX_LENGTH {
            return Err(StorageError::InvalidData(format!(
                "short code length must be between {} and {}, got {}",
                MIN_LENGTH,
                MAX_LENGTH,
                code.len()
            )));
        }

        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StorageError::InvalidData(format!(
                "short code must contain only alphanumeric characters, hyphens, or underscores: '{}'",
                code
            )));
        }

        Ok(())
    }
}

impl Display for ShortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShortCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_codes() {
        assert!(ShortCode::new("a").is_ok());
        assert!(ShortCode::new("Abc-123_xyz").is_ok());
        assert!(ShortCode::new("a".repeat(32)).is_ok());
    }

    #[test]
    fn invalid_length() {
        assert!(ShortCode::new("").is_err());
        assert!(ShortCode::new("a".repeat(33)).is_err());
    }

    #[test]
    fn invalid_characters() {
        assert!(ShortCode::new("abc def").is_err());
        assert!(ShortCode::new("abc/def").is_err());
        assert!(ShortCode::new("abc!def").is_err());
    }

    #[test]
    fn to_url_trims_trailing_slash() {
        let code = ShortCode::new("abc123").unwrap();
        assert_eq!(code.to_url("http://localhost:8080"), "http://localhost:8080/abc123");
        assert_eq!(code.to_url("http://localhost:8080/"), "http://localhost:8080/abc123");
    }

    #[test]
    fn serializes_as_plain_string() {
        let code = ShortCode::new_unchecked("q1W2e3R4");
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"q1W2e3R4\"");
        let back: ShortCode = serde_json::from_str("\"q1W2e3R4\"").unwrap();
        assert_eq!(back, code);
    }
}
