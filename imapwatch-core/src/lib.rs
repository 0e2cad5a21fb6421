mod account;
mod events;
mod session;

pub use account::Account;
pub use events::{MailboxEvent, MailboxTracker};
pub use session::{
    ImapError, ImapSession, ImapSettings, OpenedMailbox, SessionStream, connect, open_mailbox,
    watch_mailbox,
};
