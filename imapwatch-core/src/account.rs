use std::fmt;

/// A mailbox owner as provisioned in the `accounts` table.
///
/// Loaded once at startup and shared read-only for the rest of the run.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub service: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_flags: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub is_active: bool,
    pub created_at: Option<String>,
}

impl Account {
    /// `email@host:port`, used to tag log lines for this account.
    pub fn endpoint_label(&self) -> String {
        format!("{}@{}:{}", self.email, self.imap_host, self.imap_port)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("imap_flags", &self.imap_flags)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .finish()
    }
}
