use crate::types::jid::BareJid;
use serde::{Deserialize, Serialize};

/// A configured account as stored in the `accounts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub jid: BareJid,
    pub password: String,
    pub active: bool,
    pub push_enabled: bool,
    /// Cached see-other-host endpoint applied on the next connect.
    pub last_endpoint: Option<String>,
    pub roster_version: Option<String>,
    /// Identity of the certificate that caused the last trust failure,
    /// kept for the user's accept/reject decision.
    pub server_certificate: Option<CertificateIdentity>,
}

impl Account {
    pub fn new(jid: BareJid, password: &str) -> Self {
        Self {
            jid,
            password: password.to_string(),
            active: true,
            push_enabled: false,
            last_endpoint: None,
            roster_version: None,
            server_certificate: None,
        }
    }
}

/// Identity details of a server certificate that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateIdentity {
    pub subject: String,
    pub issuer: String,
    pub fingerprint_sha1: String,
    pub fingerprint_sha256: String,
}
