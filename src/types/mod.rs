pub mod account;
pub mod chat;
pub mod events;
pub mod jid;
pub mod message;
