use async_imap::imap_proto::{AttributeValue, MailboxDatum, Response, ResponseCode, Status};
use async_imap::types::UnsolicitedResponse;

/// Change notifications produced by a watched mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The mailbox is selected and IDLE is about to start.
    Ready,
    /// `count` new messages arrived.
    Mail { count: u32 },
    /// Flags or other attributes of message `seqno` changed.
    Update { seqno: u32, flags: Vec<String> },
    /// Message `seqno` was removed.
    Expunge { seqno: u32 },
    Alert { message: String },
    UidValidity { value: u32 },
    Error { message: String },
    Close { had_error: bool },
    End,
}

/// Turns unsolicited IMAP responses into [`MailboxEvent`]s.
///
/// The tracker keeps the last known `EXISTS` count so that a new count can be
/// reported as the number of newly arrived messages.
#[derive(Debug, Clone)]
pub struct MailboxTracker {
    exists: u32,
}

impl MailboxTracker {
    pub fn new(exists: u32) -> Self {
        Self { exists }
    }

    pub fn exists(&self) -> u32 {
        self.exists
    }

    pub fn observe(&mut self, response: &Response<'_>) -> Vec<MailboxEvent> {
        match response {
            Response::MailboxData(MailboxDatum::Exists(count)) => self.on_exists(*count),
            Response::Expunge(seqno) => self.on_expunge(*seqno),
            Response::Fetch(seqno, attributes) => vec![MailboxEvent::Update {
                seqno: *seqno,
                flags: flags_of(attributes),
            }],
            Response::Data {
                code: Some(ResponseCode::Alert),
                information,
                ..
            } => vec![MailboxEvent::Alert {
                message: information.as_deref().unwrap_or_default().to_string(),
            }],
            Response::Data {
                code: Some(ResponseCode::UidValidity(value)),
                ..
            } => vec![MailboxEvent::UidValidity { value: *value }],
            Response::Data {
                status: Status::Bye,
                ..
            } => vec![MailboxEvent::End],
            _ => Vec::new(),
        }
    }

    pub fn observe_unsolicited(&mut self, response: &UnsolicitedResponse) -> Vec<MailboxEvent> {
        match response {
            UnsolicitedResponse::Exists(count) => self.on_exists(*count),
            UnsolicitedResponse::Expunge(seqno) => self.on_expunge(*seqno),
            UnsolicitedResponse::Other(data) => self.observe(data.parsed()),
            _ => Vec::new(),
        }
    }

    fn on_exists(&mut self, count: u32) -> Vec<MailboxEvent> {
        let previous = self.exists;
        self.exists = count;
        if count > previous {
            vec![MailboxEvent::Mail {
                count: count - previous,
            }]
        } else {
            Vec::new()
        }
    }

    fn on_expunge(&mut self, seqno: u32) -> Vec<MailboxEvent> {
        self.exists = self.exists.saturating_sub(1);
        vec![MailboxEvent::Expunge { seqno }]
    }
}

fn flags_of(attributes: &[AttributeValue<'_>]) -> Vec<String> {
    attributes
        .iter()
        .filter_map(|attribute| match attribute {
            AttributeValue::Flags(flags) => Some(flags.iter().map(|flag| flag.to_string())),
            _ => None,
        })
        .flatten()
        .collect()
}
