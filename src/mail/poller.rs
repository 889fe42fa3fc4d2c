//! Inbound email reply relay — polls the inbox, correlates replies to their
//! mesh users, and paces the relay downlink.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::downlink::{ReplyPacer, ReplyTarget};
use crate::mail::store::MailStore;
use crate::mail::{clean_reply_body, EmailRecord, EmailStatus, InboundMail, MailTransport};

/// Resolve one inbound reply against the correlation store.
///
/// Returns the owning record and the relay text, or `None` when the reply
/// matches no live record — the mesh-side context is gone, so the reply is
/// dropped. Marks the record replied as a side effect.
pub fn resolve_reply(store: &MailStore, mail: &InboundMail) -> Option<(EmailRecord, String)> {
    let record = mail
        .refs
        .iter()
        .find_map(|thread_ref| store.lookup_by_thread(thread_ref))?;

    if record.status == EmailStatus::Closed {
        tracing::debug!(email_id = %record.email_id, "reply to closed record, dropping");
        return None;
    }

    store.mark_replied(&record.email_id);

    let text = format!(
        "Email reply received\nFrom: {}\nSubject: {}\n\n{}\n\nEmail ID: {}",
        mail.sender,
        mail.subject,
        clean_reply_body(&mail.body),
        record.email_id,
    );
    Some((record, text))
}

/// Spawn the inbox poll loop. Each matched reply is relayed to its owner's
/// node through the gateway recorded at send time, so relays still work
/// after the owner's session has expired.
pub fn spawn_poll_task(
    transport: Arc<dyn MailTransport>,
    store: Arc<MailStore>,
    pacer: Arc<ReplyPacer>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tick.tick().await;

            let replies = match transport.fetch_replies().await {
                Ok(replies) => replies,
                Err(e) => {
                    tracing::warn!(error = %e, "inbox poll failed");
                    continue;
                }
            };

            for mail in replies {
                match resolve_reply(&store, &mail) {
                    Some((record, text)) => {
                        tracing::info!(
                            email_id = %record.email_id,
                            owner = record.owner,
                            "relaying email reply"
                        );
                        pacer.send(
                            ReplyTarget {
                                user: record.owner,
                                gateway: record.owner_gateway.clone(),
                                channel: record.owner_channel,
                            },
                            text,
                        );
                    }
                    None => {
                        tracing::debug!(sender = %mail.sender, "unmatched email reply, dropping");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(refs: &[&str]) -> InboundMail {
        InboundMail {
            sender: "alice@example.com".into(),
            subject: "Re: Hello".into(),
            body: "Got it, thanks!\n> original text".into(),
            refs: refs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn reply_resolves_through_thread_ref() {
        let store = MailStore::new();
        let id = store.register(42, "!a1b2c3d4", 1, "alice@example.com", "Hello", "t1@meshdm.local");

        let (record, text) = resolve_reply(&store, &inbound(&["t1@meshdm.local"])).unwrap();
        assert_eq!(record.email_id, id);
        assert_eq!(record.owner, 42);
        assert!(text.contains("From: alice@example.com"));
        assert!(text.contains("Got it, thanks!"));
        assert!(!text.contains("> original text"));
        assert!(text.contains(&format!("Email ID: {id}")));

        // Side effect: the record is now Replied.
        assert_eq!(store.lookup(&id).unwrap().status, EmailStatus::Replied);
    }

    #[test]
    fn later_refs_still_match() {
        let store = MailStore::new();
        store.register(42, "!a1b2c3d4", 1, "alice@example.com", "Hello", "t1@meshdm.local");

        let resolved = resolve_reply(&store, &inbound(&["other@x", "t1@meshdm.local"]));
        assert!(resolved.is_some());
    }

    #[test]
    fn unmatched_reply_is_dropped() {
        let store = MailStore::new();
        store.register(42, "!a1b2c3d4", 1, "alice@example.com", "Hello", "t1@meshdm.local");

        assert!(resolve_reply(&store, &inbound(&["unknown@meshdm.local"])).is_none());
        assert!(resolve_reply(&store, &inbound(&[])).is_none());
    }

    #[test]
    fn reply_to_closed_record_is_dropped() {
        let store = MailStore::new();
        let id = store.register(42, "!a1b2c3d4", 1, "alice@example.com", "Hello", "t1@meshdm.local");
        store.close(&id);

        assert!(resolve_reply(&store, &inbound(&["t1@meshdm.local"])).is_none());
        assert_eq!(store.lookup(&id).unwrap().status, EmailStatus::Closed);
    }
}
