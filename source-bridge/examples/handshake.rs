//! Host and guest in one process, talking over an in-memory router.
//!
//! Run with `RUST_LOG=debug cargo run --example handshake` to see every
//! envelope. A second guest that never says hello shows the timeout path.

use chrono::Utc;
use source_bridge::prelude::*;
use tracing_subscriber::EnvFilter;

const APP_ORIGIN: &str = "https://app.example";

#[derive(Debug, Serialize, Deserialize)]
struct Theme {
    dark: bool,
}

fn host_options() -> HostOptions {
    HostOptions::new(|| async {
        Ok::<_, HandlerError>(Auth::new(
            "demo-token",
            Utc::now() + chrono::Duration::minutes(15),
        ))
    })
    .hello_timeout(Duration::from_secs(1))
    .ready_timeout(Duration::from_secs(3))
    .on_hello(|| async {
        Ok(HelloPayload {
            context: Some(Context::for_member("member-1")),
            auth: None,
            plugin_info: Some(PluginInfo {
                application: "demo".to_string(),
                view_key: "dashboard".to_string(),
                surface: "panel".to_string(),
            }),
        })
    })
    .on_ready(|host| {
        tracing::info!("guest ready, pushing theme");
        if let Err(e) = host.send_event("theme", &Theme { dark: true }) {
            tracing::warn!("could not push theme: {}", e);
        }
    })
    .on_error(|host, err| {
        tracing::error!(cause = %err.cause, "guest failed to load");
        host.destroy();
    })
}

fn host(router: &MemoryRouter, name: &str, guest: &str, guest_origin: &str) -> HostSession {
    let (channel, inbox) = router.register(name, APP_ORIGIN);
    let config = ClientConfig::new(Counterpart::new(guest, guest_origin)).with_label(name);
    HostSession::new(TransportClient::new(config, channel, inbox), host_options())
}

fn guest(router: &MemoryRouter, name: &str, origin: &str, host: &str) -> GuestSession {
    let (channel, inbox) = router.register(name, origin);
    let config = ClientConfig::new(Counterpart::new(host, APP_ORIGIN)).with_label(name);
    GuestSession::new(TransportClient::new(config, channel, inbox))
}

async fn run() -> Result<(), GuestError> {
    let router = MemoryRouter::new();

    let host_a = host(&router, "host-a", "plugin-a", "https://plugin-a.example");
    let plugin_a = guest(&router, "plugin-a", "https://plugin-a.example", "host-a");

    let host_b = host(&router, "host-b", "plugin-b", "https://plugin-b.example");
    let _silent = guest(&router, "plugin-b", "https://plugin-b.example", "host-b");

    host_a.boot();
    host_b.boot();

    let options = GuestOptions::new().on_event("theme", |theme: Theme| async move {
        tracing::info!(dark = theme.dark, "theme received");
        Ok(())
    });
    let _: HelloPayload = plugin_a.init(options).await?;

    match plugin_a.current_context() {
        Ok(context) => tracing::info!(member = ?context.member, "context"),
        Err(e) => tracing::warn!("{}", e),
    }
    match plugin_a.info() {
        Ok(info) => tracing::info!(surface = %info.surface, "mounted"),
        Err(e) => tracing::warn!("{}", e),
    }

    let auth = plugin_a.current_token().await?;
    tracing::info!(token = %auth.token, expires_at = %auth.expires_at, "token");

    // Let host-b's timers fire.
    tokio::time::sleep(Duration::from_secs(4)).await;
    tracing::info!(
        host_a = ?host_a.state(),
        host_b = ?host_b.state(),
        "final states"
    );

    plugin_a.destroy();
    host_a.destroy();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            if let Err(e) = run().await {
                tracing::error!(error = %e, "demo failed");
            }
        })
        .await;
}
