use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JidError {
    #[error("invalid bare JID: {0}")]
    Invalid(String),
}

/// A bare XMPP address (`user@domain`), normalized to lowercase.
///
/// Used both as the account identifier and as the conversation peer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BareJid(String);

impl BareJid {
    pub fn new(node: &str, domain: &str) -> Result<Self, JidError> {
        format!("{node}@{domain}").parse()
    }

    pub fn node(&self) -> &str {
        // Constructor guarantees exactly one '@'.
        self.0.split_once('@').map(|(n, _)| n).unwrap_or("")
    }

    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BareJid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.split_once('@') {
            Some((node, domain))
                if !node.is_empty() && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(BareJid(trimmed.to_lowercase()))
            }
            _ => Err(JidError::Invalid(s.to_string())),
        }
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
