//! Email correlation store — maps short email ids and thread refs back to
//! the mesh users who originated them.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::mail::{EmailRecord, EmailStatus};

/// Owns all [`EmailRecord`]s. Serialized behind one lock, same contract as
/// the session store. Records survive session expiry so asynchronous email
/// replies can still find their mesh user.
#[derive(Default)]
pub struct MailStore {
    inner: Mutex<HashMap<String, EmailRecord>>,
}

impl MailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly dispatched email and return its short id, unique for
    /// the store's lifetime.
    pub fn register(
        &self,
        owner: u32,
        owner_gateway: &str,
        owner_channel: u32,
        recipient: &str,
        subject: &str,
        thread_ref: &str,
    ) -> String {
        let mut map = self.inner.lock().unwrap();
        let email_id = loop {
            let candidate = short_id();
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };
        map.insert(
            email_id.clone(),
            EmailRecord {
                email_id: email_id.clone(),
                owner,
                owner_gateway: owner_gateway.to_string(),
                owner_channel,
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                thread_ref: thread_ref.to_string(),
                created_at: chrono::Utc::now(),
                status: EmailStatus::Sent,
            },
        );
        tracing::info!(email_id, owner, "email registered");
        email_id
    }

    pub fn lookup(&self, email_id: &str) -> Option<EmailRecord> {
        self.inner.lock().unwrap().get(email_id).cloned()
    }

    /// Resolve an inbound reply's thread ref to the record it answers.
    pub fn lookup_by_thread(&self, thread_ref: &str) -> Option<EmailRecord> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .find(|r| r.thread_ref == thread_ref)
            .cloned()
    }

    /// Transition `Sent` → `Replied`. Idempotent; returns false for an
    /// unknown or closed record.
    pub fn mark_replied(&self, email_id: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get_mut(email_id) {
            Some(record) if record.status != EmailStatus::Closed => {
                record.status = EmailStatus::Replied;
                true
            }
            _ => false,
        }
    }

    /// Close a record; relaying stops for it.
    pub fn close(&self, email_id: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get_mut(email_id) {
            Some(record) => {
                record.status = EmailStatus::Closed;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Short, readable email id: two uppercase letters and three digits.
fn short_id() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..2).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
    let digits: String = (0..3).map(|_| rng.gen_range(b'0'..=b'9') as char).collect();
    format!("{letters}{digits}")
}
