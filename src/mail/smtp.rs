//! SMTP/IMAP mail transport — lettre for outbound, raw IMAP over rustls for
//! the inbox poll, parsed with mail-parser.

use std::collections::HashSet;
use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use uuid::Uuid;

use crate::error::MailError;
use crate::mail::{normalize_msgid, InboundMail, MailTransport, OutboundMail};

/// Domain used in generated Message-IDs.
const MESSAGE_ID_DOMAIN: &str = "meshdm.local";

// ── Configuration ───────────────────────────────────────────────────

/// Email bridge configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl MailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAIL_IMAP_HOST` is not set (bridge disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("MAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("MAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("MAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("MAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("MAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("MAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            imap_host,
            imap_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// SMTP outbound + IMAP inbound implementation of [`MailTransport`].
pub struct SmtpImapMailer {
    config: MailConfig,
    seen_messages: Arc<Mutex<HashSet<String>>>,
}

impl SmtpImapMailer {
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            seen_messages: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl MailTransport for SmtpImapMailer {
    async fn send(&self, mail: &OutboundMail) -> Result<String, MailError> {
        let thread_ref = format!("{}@{}", Uuid::new_v4(), MESSAGE_ID_DOMAIN);

        let mut builder = Message::builder()
            .from(self.config.from_address.parse().map_err(|e| {
                MailError::BuildFailed(format!("invalid from address: {e}"))
            })?)
            .to(mail
                .recipient
                .parse()
                .map_err(|e| MailError::BuildFailed(format!("invalid recipient: {e}")))?)
            .subject(mail.subject.clone())
            .message_id(Some(format!("<{thread_ref}>")));

        if let Some(parent) = &mail.reply_thread_ref {
            builder = builder
                .in_reply_to(format!("<{parent}>"))
                .references(format!("<{parent}>"));
        }

        let message = builder
            .body(relay_body(&mail.body, mail.owner))
            .map_err(|e| MailError::BuildFailed(e.to_string()))?;

        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| MailError::SendFailed(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .build();

        transport
            .send(&message)
            .map_err(|e| MailError::SendFailed(e.to_string()))?;

        tracing::info!(recipient = %mail.recipient, owner = mail.owner, "email dispatched");
        Ok(thread_ref)
    }

    async fn fetch_replies(&self) -> Result<Vec<InboundMail>, MailError> {
        let config = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| MailError::FetchFailed(format!("fetch task panicked: {e}")))?
            .map_err(|e| MailError::FetchFailed(e.to_string()))?;

        let mut seen = self.seen_messages.lock().unwrap();
        Ok(fetched
            .into_iter()
            .filter(|(msg_id, _)| seen.insert(msg_id.clone()))
            .map(|(_, mail)| mail)
            .collect())
    }
}

/// Outbound body plus the relay footer replies will quote back.
pub(crate) fn relay_body(body: &str, owner: u32) -> String {
    format!(
        "{body}\n\n--\nThis message was relayed from the mesh network on behalf of node {owner}.\n\
         Reply to this email to message them back."
    )
}

// ── Inbox fetch (blocking; run in spawn_blocking) ───────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// Fetch unseen emails via raw IMAP over TLS and parse out the fields the
/// correlation path needs. Returns `(message_id, mail)` pairs.
fn fetch_unseen(config: &MailConfig) -> Result<Vec<(String, InboundMail)>, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let read_line =
        |tls: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>| -> Result<String, ImapError> {
            let mut buf = Vec::new();
            loop {
                let mut byte = [0u8; 1];
                match std::io::Read::read(tls, &mut byte) {
                    Ok(0) => return Err("IMAP connection closed".into()),
                    Ok(_) => {
                        buf.push(byte[0]);
                        if buf.ends_with(b"\r\n") {
                            return Ok(String::from_utf8_lossy(&buf).to_string());
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

    let send_cmd =
        |tls: &mut rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
         tag: &str,
         cmd: &str|
         -> Result<Vec<String>, ImapError> {
            let full = format!("{tag} {cmd}\r\n");
            IoWrite::write_all(tls, full.as_bytes())?;
            IoWrite::flush(tls)?;
            let mut lines = Vec::new();
            loop {
                let line = read_line(tls)?;
                let done = line.starts_with(tag);
                lines.push(line);
                if done {
                    break;
                }
            }
            Ok(lines)
        };

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!("LOGIN \"{}\" \"{}\"", config.username, config.password),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let search_resp = send_cmd(&mut tls, "A3", "SEARCH UNSEEN")?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(str::to_string));
        }
    }

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {uid} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            let msg_id = parsed
                .message_id()
                .map(normalize_msgid)
                .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

            let sender = parsed
                .from()
                .and_then(|addr| addr.first())
                .and_then(|a| a.address())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".into());

            let subject = parsed.subject().unwrap_or("(no subject)").to_string();
            let body = extract_body(&parsed);

            let mut refs = header_ids(parsed.header("In-Reply-To"));
            refs.extend(header_ids(parsed.header("References")));

            results.push((
                msg_id,
                InboundMail {
                    sender,
                    subject,
                    body,
                    refs,
                },
            ));
        }

        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let _ = send_cmd(&mut tls, &store_tag, &format!("STORE {uid} +FLAGS (\\Seen)"));
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

/// Collect message ids out of an In-Reply-To or References header value.
fn header_ids(value: Option<&mail_parser::HeaderValue>) -> Vec<String> {
    match value {
        Some(mail_parser::HeaderValue::Text(t)) => vec![normalize_msgid(t)],
        Some(mail_parser::HeaderValue::TextList(list)) => {
            list.iter().map(|t| normalize_msgid(t)).collect()
        }
        _ => Vec::new(),
    }
}

/// Readable text from a parsed email, preferring the plain part.
fn extract_body(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

/// Drop HTML tags and collapse whitespace.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
