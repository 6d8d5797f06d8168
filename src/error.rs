use crate::store::error::StoreError;
use crate::types::jid::BareJid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("account not found: {0}")]
    AccountNotFound(BareJid),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
