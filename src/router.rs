//! Command router — dispatches decoded messages against session state.
//!
//! Public channel: only `/bot` is honored; everything else is ignored so the
//! bot never adds channel noise. Private commands require a live session.
//! Multi-step flows (email composition) ride on the session's pending state;
//! a recognized command always aborts a pending flow in favor of the new
//! command, keeping the bot responsive over flow completion.
//!
//! Handlers return the replies to send; the caller hands them to the pacer.
//! Collaborators (AI, weather, mail) are trait objects so the state machine
//! tests with mocks, transport-free.

use std::sync::Arc;

use crate::ai::AiProvider;
use crate::downlink::ReplyTarget;
use crate::envelope::DecodedMessage;
use crate::error::WeatherError;
use crate::mail::store::MailStore;
use crate::mail::{reply_subject, MailTransport, OutboundMail};
use crate::session::{EmailDraft, PendingState, SessionStore};
use crate::weather::WeatherProvider;

const GREETING: &str = "Hi! Session started. DM me /ai <question>, /weather, or /email \
<recipient> <subject>. Send /help for the full list.";

const NO_SESSION: &str =
    "No active session. Send /bot on the public channel to start one.";

const UNKNOWN_COMMAND: &str = "Unrecognized command. Send /help for the list.";

const EMAIL_SYNTAX: &str =
    "Email syntax: /email <recipient> <subject>\nExample: /email user@example.com Hello there";

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Bot,
    Help,
    Ai(&'a str),
    Weather(&'a str),
    EmailCompose(&'a str),
    EmailGet(&'a str),
    EmailReply(&'a str),
}

impl<'a> Command<'a> {
    /// Tokenize a leading `/word` and its argument remainder. Returns `None`
    /// for anything that is not a recognized command.
    pub fn parse(text: &'a str) -> Option<Self> {
        let rest = text.trim().strip_prefix('/')?;
        let (word, args) = split_word(rest);

        match word.to_lowercase().as_str() {
            "bot" => Some(Self::Bot),
            "help" => Some(Self::Help),
            "ai" => Some(Self::Ai(args)),
            "weather" => Some(Self::Weather(args)),
            "email" => {
                let (sub, sub_args) = split_word(args);
                match sub.to_lowercase().as_str() {
                    "get" => Some(Self::EmailGet(sub_args)),
                    "reply" => Some(Self::EmailReply(sub_args)),
                    _ => Some(Self::EmailCompose(args)),
                }
            }
            _ => None,
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((w, rest)) => (w, rest.trim()),
        None => (s, ""),
    }
}

/// A reply the router wants delivered (via the pacer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub target: ReplyTarget,
    pub text: String,
}

fn reply(msg: &DecodedMessage, text: impl Into<String>) -> Reply {
    Reply {
        target: ReplyTarget {
            user: msg.sender,
            gateway: msg.gateway.clone(),
            channel: msg.channel,
        },
        text: text.into(),
    }
}

/// Everything the router needs injected. Collaborators are optional;
/// commands for an absent one answer with a short "not configured" note.
pub struct RouterDeps {
    pub sessions: Arc<SessionStore>,
    pub emails: Arc<MailStore>,
    pub ai: Option<Arc<dyn AiProvider>>,
    pub weather: Option<Arc<dyn WeatherProvider>>,
    pub mail: Option<Arc<dyn MailTransport>>,
}

/// The stateful routing engine.
pub struct Router {
    sessions: Arc<SessionStore>,
    emails: Arc<MailStore>,
    ai: Option<Arc<dyn AiProvider>>,
    weather: Option<Arc<dyn WeatherProvider>>,
    mail: Option<Arc<dyn MailTransport>>,
}

impl Router {
    pub fn new(deps: RouterDeps) -> Self {
        Self {
            sessions: deps.sessions,
            emails: deps.emails,
            ai: deps.ai,
            weather: deps.weather,
            mail: deps.mail,
        }
    }

    /// Route one decoded message; returns the replies to send.
    pub async fn handle(&self, msg: &DecodedMessage) -> Vec<Reply> {
        if msg.is_private() {
            self.handle_private(msg).await
        } else {
            self.handle_public(msg)
        }
    }

    /// Public channel: `/bot` starts (or refreshes) a session, everything
    /// else is dropped without a response.
    fn handle_public(&self, msg: &DecodedMessage) -> Vec<Reply> {
        match Command::parse(&msg.text) {
            Some(Command::Bot) => {
                self.sessions
                    .create_or_refresh(msg.sender, &msg.gateway, msg.channel);
                vec![reply(msg, GREETING)]
            }
            _ => {
                tracing::debug!(sender = msg.sender, "ignoring public text");
                Vec::new()
            }
        }
    }

    async fn handle_private(&self, msg: &DecodedMessage) -> Vec<Reply> {
        // No silent auto-provisioning from stray DMs: a missing or expired
        // session gets a pointer to /bot and nothing else.
        let Some(session) = self
            .sessions
            .touch(msg.sender, &msg.gateway, msg.channel)
        else {
            return vec![reply(msg, NO_SESSION)];
        };

        if let PendingState::AwaitingEmailBody(draft) = session.pending {
            return match Command::parse(&msg.text) {
                Some(cmd) => {
                    // Reset semantics: a new command wins over the flow.
                    self.sessions.clear_pending(msg.sender);
                    self.dispatch(msg, cmd).await
                }
                None => self.finish_email(msg, draft, msg.text.trim()).await,
            };
        }

        match Command::parse(&msg.text) {
            Some(cmd) => self.dispatch(msg, cmd).await,
            None => vec![reply(msg, UNKNOWN_COMMAND)],
        }
    }

    async fn dispatch(&self, msg: &DecodedMessage, cmd: Command<'_>) -> Vec<Reply> {
        match cmd {
            Command::Bot => {
                self.sessions
                    .create_or_refresh(msg.sender, &msg.gateway, msg.channel);
                vec![reply(msg, GREETING)]
            }
            Command::Help => vec![reply(msg, help_text())],
            Command::Ai(question) => self.handle_ai(msg, question).await,
            Command::Weather(args) => self.handle_weather(msg, args).await,
            Command::EmailCompose(args) => self.handle_email_compose(msg, args),
            Command::EmailGet(id) => self.handle_email_get(msg, id),
            Command::EmailReply(args) => self.handle_email_reply(msg, args),
        }
    }

    // ── /ai ─────────────────────────────────────────────────────────

    async fn handle_ai(&self, msg: &DecodedMessage, question: &str) -> Vec<Reply> {
        if question.is_empty() {
            return vec![reply(msg, "Send /ai followed by your question.")];
        }
        let Some(ai) = &self.ai else {
            return vec![reply(msg, "The AI backend is not configured.")];
        };

        match ai.ask(msg.sender, question).await {
            Ok(answer) => vec![reply(msg, answer)],
            Err(e) => {
                tracing::warn!(user = msg.sender, error = %e, "AI request failed");
                vec![reply(msg, "Sorry, the AI request failed. Please try again.")]
            }
        }
    }

    // ── /weather ────────────────────────────────────────────────────

    async fn handle_weather(&self, msg: &DecodedMessage, args: &str) -> Vec<Reply> {
        let Some(weather) = &self.weather else {
            return vec![reply(msg, "Weather lookups are not configured.")];
        };

        if args.eq_ignore_ascii_case("clear") {
            self.sessions.clear_cached_location(msg.sender);
            return vec![reply(msg, "Location cleared. Send /weather with a new location.")];
        }

        let point = if !args.is_empty() {
            match weather.resolve(args).await {
                Ok(point) => {
                    self.sessions.cache_location(msg.sender, point.clone());
                    point
                }
                Err(WeatherError::UnknownLocation(_)) => {
                    return vec![reply(
                        msg,
                        "Sorry, I couldn't parse that location. Try 'lat,lon' or 'City, Country'.",
                    )];
                }
                Err(e) => {
                    tracing::warn!(user = msg.sender, error = %e, "location resolve failed");
                    return vec![reply(msg, "Sorry, the location lookup failed. Please try again.")];
                }
            }
        } else {
            match self.sessions.cached_location(msg.sender) {
                Some(point) => point,
                None => {
                    return vec![reply(
                        msg,
                        "I need a location. Send /weather <lat,lon> or /weather <City, Country>.",
                    )];
                }
            }
        };

        match weather.forecast(&point).await {
            Ok(forecast) => vec![reply(msg, forecast.render(&point.label))],
            Err(e) => {
                tracing::warn!(user = msg.sender, error = %e, "forecast failed");
                vec![reply(msg, "Sorry, the forecast lookup failed. Please try again.")]
            }
        }
    }

    // ── /email ──────────────────────────────────────────────────────

    fn handle_email_compose(&self, msg: &DecodedMessage, args: &str) -> Vec<Reply> {
        if self.mail.is_none() {
            return vec![reply(msg, "The email bridge is not configured.")];
        }

        let Some((recipient, subject)) = args.split_once(char::is_whitespace) else {
            return vec![reply(msg, EMAIL_SYNTAX)];
        };
        let subject = subject.trim();
        if subject.is_empty() {
            return vec![reply(msg, EMAIL_SYNTAX)];
        }
        if !looks_like_address(recipient) {
            return vec![reply(msg, "Please provide a valid email address.")];
        }

        self.sessions.set_pending(
            msg.sender,
            PendingState::AwaitingEmailBody(EmailDraft {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                in_reply_to: None,
            }),
        );

        vec![reply(
            msg,
            format!(
                "Draft prepared:\nTo: {recipient}\nSubject: {subject}\n\nNow send the email body as your next message."
            ),
        )]
    }

    fn handle_email_get(&self, msg: &DecodedMessage, id: &str) -> Vec<Reply> {
        if id.is_empty() {
            return vec![reply(msg, "Provide an email id: /email get <id>")];
        }
        let id = id.to_uppercase();

        let Some(record) = self.emails.lookup(&id) else {
            return vec![reply(msg, format!("No email with id {id}."))];
        };
        if record.owner != msg.sender {
            return vec![reply(msg, "You don't have access to that email.")];
        }

        vec![reply(
            msg,
            format!(
                "Email {id}\nStatus: {}\nSent: {}\nTo: {}\nSubject: {}",
                record.status,
                record.created_at.format("%Y-%m-%d %H:%M UTC"),
                record.recipient,
                record.subject,
            ),
        )]
    }

    fn handle_email_reply(&self, msg: &DecodedMessage, args: &str) -> Vec<Reply> {
        if self.mail.is_none() {
            return vec![reply(msg, "The email bridge is not configured.")];
        }

        let (id, subject_override) = split_word(args);
        if id.is_empty() {
            return vec![reply(msg, "Reply syntax: /email reply <id> [subject]")];
        }
        let id = id.to_uppercase();

        let Some(record) = self.emails.lookup(&id) else {
            return vec![reply(msg, format!("No email with id {id}."))];
        };
        if record.owner != msg.sender {
            return vec![reply(msg, "You don't have access to that email.")];
        }

        let subject = if subject_override.is_empty() {
            reply_subject(&record.subject)
        } else {
            subject_override.to_string()
        };

        self.sessions.set_pending(
            msg.sender,
            PendingState::AwaitingEmailBody(EmailDraft {
                recipient: record.recipient.clone(),
                subject: subject.clone(),
                in_reply_to: Some(record.email_id),
            }),
        );

        vec![reply(
            msg,
            format!(
                "Reply draft prepared:\nTo: {}\nSubject: {subject}\n\nNow send the reply body as your next message.",
                record.recipient,
            ),
        )]
    }

    /// Second step of the compose flow: the message is the body, verbatim.
    async fn finish_email(
        &self,
        msg: &DecodedMessage,
        draft: EmailDraft,
        body: &str,
    ) -> Vec<Reply> {
        self.sessions.clear_pending(msg.sender);

        let Some(mail) = &self.mail else {
            return vec![reply(msg, "The email bridge is not configured.")];
        };

        let reply_thread_ref = draft
            .in_reply_to
            .as_deref()
            .and_then(|id| self.emails.lookup(id))
            .map(|r| r.thread_ref);

        let outbound = OutboundMail {
            owner: msg.sender,
            recipient: draft.recipient.clone(),
            subject: draft.subject.clone(),
            body: body.to_string(),
            reply_thread_ref,
        };

        match mail.send(&outbound).await {
            Ok(thread_ref) => {
                let id = self.emails.register(
                    msg.sender,
                    &msg.gateway,
                    msg.channel,
                    &draft.recipient,
                    &draft.subject,
                    &thread_ref,
                );
                vec![reply(
                    msg,
                    format!(
                        "Email sent!\nEmail ID: {id}\nUse /email get {id} to view it or /email reply {id} to follow up."
                    ),
                )]
            }
            Err(e) => {
                tracing::warn!(user = msg.sender, error = %e, "email send failed");
                vec![reply(msg, "Sorry, sending the email failed. Please try again.")]
            }
        }
    }
}

/// Minimal shape check; real validation is the SMTP server's problem.
fn looks_like_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

fn help_text() -> String {
    [
        "Commands:",
        "/ai <question> - ask the AI",
        "/weather - forecast for your cached location",
        "/weather <lat,lon> - forecast by coordinates",
        "/weather <City, Country> - forecast by place name",
        "/weather clear - forget cached location",
        "/email <recipient> <subject> - compose an email (body follows)",
        "/email get <id> - view a sent email",
        "/email reply <id> [subject] - reply in a thread",
        "/bot - refresh your session",
        "/help - this list",
    ]
    .join("\n")
}
