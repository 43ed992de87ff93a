//! Domain models for archived mail

mod account;
mod checkpoint;
mod message;

pub use account::{Account, ImapSettings, ProviderKind};
pub use checkpoint::{Checkpoint, FolderMark};
pub use message::{EmailAddress, EmailId, MessageRecord};
