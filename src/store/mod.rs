pub mod accounts;
pub mod chats;
pub mod db;
pub mod error;
pub mod history;
pub mod schema;

pub use accounts::AccountStore;
pub use chats::ChatStore;
pub use db::Database;
pub use history::{AppendOutcome, MessageStore};
