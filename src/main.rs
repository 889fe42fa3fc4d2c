use std::sync::Arc;

use meshdm::ai::{self, AiConfig};
use meshdm::config::BotConfig;
use meshdm::downlink::{Downlink, ReplyPacer};
use meshdm::envelope;
use meshdm::mail::{poller, MailConfig, MailStore, MailTransport, SmtpImapMailer};
use meshdm::router::{Router, RouterDeps};
use meshdm::session::{self, SessionStore};
use meshdm::transport::{self, MeshConfig};
use meshdm::weather::{OpenMeteoProvider, WeatherProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage (IMAP poll)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let bot_config = BotConfig::from_env();
    let mesh_config = MeshConfig::from_env();

    eprintln!("📡 meshdm v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   MQTT: {}:{} (filter: {})",
        mesh_config.host, mesh_config.port, mesh_config.root_filter
    );
    eprintln!(
        "   Chunks: {} bytes, {} ms apart",
        bot_config.chunk_max_bytes,
        bot_config.chunk_delay.as_millis()
    );
    eprintln!(
        "   Sessions: {} s TTL, sweep every {} s",
        bot_config.session_ttl.as_secs(),
        bot_config.sweep_interval.as_secs()
    );

    // ── Stores ──────────────────────────────────────────────────────────
    let sessions = Arc::new(SessionStore::new(bot_config.session_ttl));
    let emails = Arc::new(MailStore::new());

    // ── Transport + downlink ────────────────────────────────────────────
    let (sink, mut uplink, _transport_handle) = transport::start(&mesh_config);
    let downlink = Arc::new(Downlink::new(Arc::new(sink)));
    let pacer = Arc::new(ReplyPacer::new(
        Arc::clone(&downlink),
        bot_config.chunk_max_bytes,
        bot_config.chunk_delay,
    ));

    // ── Collaborators ───────────────────────────────────────────────────
    let ai_provider = match AiConfig::from_env() {
        Some(config) => match ai::create_provider(&config) {
            Ok(provider) => {
                eprintln!("   AI: enabled ({})", provider.model_name());
                Some(provider)
            }
            Err(e) => {
                eprintln!("   AI: disabled ({e})");
                None
            }
        },
        None => {
            eprintln!("   AI: disabled (GEMINI_API_KEY not set)");
            None
        }
    };

    let mail: Option<Arc<dyn MailTransport>> = match MailConfig::from_env() {
        Some(config) => {
            eprintln!(
                "   Email: enabled (IMAP: {}, SMTP: {})",
                config.imap_host, config.smtp_host
            );
            Some(Arc::new(SmtpImapMailer::new(config)))
        }
        None => {
            eprintln!("   Email: disabled (MAIL_IMAP_HOST not set)");
            None
        }
    };

    let weather: Arc<dyn WeatherProvider> = Arc::new(OpenMeteoProvider::new());
    eprintln!("   Weather: enabled (Open-Meteo)\n");

    // ── Background tasks ────────────────────────────────────────────────
    let _sweep_handle = session::spawn_sweep_task(Arc::clone(&sessions), bot_config.sweep_interval);

    if let Some(mail_transport) = &mail {
        let _poll_handle = poller::spawn_poll_task(
            Arc::clone(mail_transport),
            Arc::clone(&emails),
            Arc::clone(&pacer),
            bot_config.mail_poll_interval,
        );
    }

    // ── Router loop ─────────────────────────────────────────────────────
    let router = Router::new(RouterDeps {
        sessions,
        emails,
        ai: ai_provider,
        weather: Some(weather),
        mail,
    });

    // Single consumer of the ingest queue: decode, route, hand replies to
    // the pacer. Decode failures are expected mesh noise.
    while let Some(packet) = uplink.recv().await {
        match envelope::decode(&packet.topic, &packet.payload) {
            Ok(msg) => {
                for reply in router.handle(&msg).await {
                    pacer.send(reply.target, reply.text);
                }
            }
            Err(e) => {
                tracing::debug!(topic = %packet.topic, error = %e, "dropping frame");
            }
        }
    }

    Err(anyhow::anyhow!("mesh ingest queue closed"))
}
