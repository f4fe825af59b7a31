use serde::Deserialize;
use std::fmt;

/// Registry password or token. Prints as "<REDACTED, length N>" through Debug and Display,
/// so resolved pull-secret credentials can be logged without leaking them.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    /// Access the raw secret when building an Authorization header
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted_in_debug_output() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 7>");
        assert_eq!(format!("{}", secret), "<REDACTED, length 7>");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_secret_deserializes_from_plain_string() {
        let secret: SecretString = serde_json::from_str("\"token\"").expect("Should deserialize");
        assert_eq!(secret.expose_secret(), "token");
    }
}
