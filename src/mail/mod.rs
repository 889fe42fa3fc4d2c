//! Email bridging — correlation store, SMTP/IMAP glue, reply relay.

pub mod poller;
pub mod smtp;
pub mod store;

pub use smtp::{MailConfig, SmtpImapMailer};
pub use store::MailStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;

/// Delivery status of an outbound email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailStatus {
    /// Dispatched, no reply seen yet.
    Sent,
    /// At least one correlated reply has come back.
    Replied,
    /// Closed by an operator; no further relaying.
    Closed,
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Replied => write!(f, "replied"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Correlation of a mesh user to an email thread the bot sent on their
/// behalf. Memory-resident; never destroyed automatically.
#[derive(Debug, Clone)]
pub struct EmailRecord {
    /// Short token surfaced to the user (`/email get <id>`).
    pub email_id: String,
    /// Mesh node that authored the email.
    pub owner: u32,
    /// Gateway/channel to address async reply relays through, in case the
    /// owner's session has expired by the time a reply arrives.
    pub owner_gateway: String,
    pub owner_channel: u32,
    pub recipient: String,
    pub subject: String,
    /// Message-ID (angle brackets stripped) stamped on the outbound mail;
    /// inbound replies reference it.
    pub thread_ref: String,
    pub created_at: DateTime<Utc>,
    pub status: EmailStatus,
}

/// An email to dispatch on behalf of a mesh user.
#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub owner: u32,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Thread ref of the mail being replied to, for In-Reply-To/References.
    pub reply_thread_ref: Option<String>,
}

/// A reply fetched from the inbox, before correlation.
#[derive(Debug, Clone)]
pub struct InboundMail {
    pub sender: String,
    pub subject: String,
    pub body: String,
    /// Message ids from In-Reply-To and References (normalized).
    pub refs: Vec<String>,
}

/// Email send/receive contract. The SMTP/IMAP implementation lives in
/// [`smtp`]; the core and tests only see this trait.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Dispatch `mail` and return the thread ref stamped on it.
    async fn send(&self, mail: &OutboundMail) -> Result<String, MailError>;

    /// Fetch unseen replies from the inbox.
    async fn fetch_replies(&self) -> Result<Vec<InboundMail>, MailError>;
}

/// Strip a Message-ID down to its comparable form: no angle brackets,
/// no surrounding whitespace.
pub fn normalize_msgid(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Conventional reply subject: prefix `Re: ` unless already present.
pub fn reply_subject(original: &str) -> String {
    let original = original.trim();
    if original.is_empty() {
        return "Re: Message".to_string();
    }
    if original.to_lowercase().starts_with("re:") {
        return original.to_string();
    }
    format!("Re: {original}")
}

/// Marker line the bot appends to outbound mail; replies quote it back.
pub const RELAY_FOOTER_MARKER: &str = "relayed from the mesh network";

/// Clean a reply body for mesh relay: drop quoted lines, reply
/// attributions, and everything from the relay footer on. Falls back to a
/// truncated original when nothing meaningful survives.
pub fn clean_reply_body(body: &str) -> String {
    let mut kept = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        if trimmed.to_lowercase().contains(RELAY_FOOTER_MARKER) {
            break;
        }
        if !trimmed.is_empty() {
            kept.push(trimmed);
        }
    }

    let cleaned = kept.join("\n");
    if cleaned.len() >= 5 {
        return cleaned;
    }

    // Over-aggressive cleaning; hand back a bounded slice of the original.
    let mut fallback: String = body.trim().chars().take(200).collect();
    if body.trim().chars().count() > 200 {
        fallback.push_str("...");
    }
    fallback
}
