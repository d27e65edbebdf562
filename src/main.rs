use clap::Parser;
use recording_proxy::{
    api::{self, AppState},
    BypassList, CaptureLimits, CertificateAuthority, InterceptEngine, PacketStore,
    PassthroughEngine, ProxyConfig, ProxyEngine, ProxyServer, ReplayClient, RuleEngine,
    TrafficInterceptor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Recording proxy - captures, mutates and replays browser traffic
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the proxy and control API listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen_host: String,

    /// Proxy port (0 picks any free port)
    #[arg(long, default_value_t = 0)]
    listen_port: u16,

    /// Control API port
    #[arg(long, default_value_t = 7070)]
    api_port: u16,

    /// Where captured packets are persisted
    #[arg(long, default_value = "data/packets.json")]
    persist_path: PathBuf,

    /// Directory holding the root CA certificate and key
    #[arg(long, default_value = "./certs")]
    ca_dir: PathBuf,

    /// Decrypt HTTPS with a locally trusted CA instead of opaque tunnels
    #[arg(long, default_value_t = false)]
    intercept_tls: bool,

    /// Host patterns whose traffic bypasses rule evaluation (repeatable)
    #[arg(long = "bypass-host")]
    bypass_hosts: Vec<String>,
}

impl Args {
    fn config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            api_port: self.api_port,
            persist_path: Some(self.persist_path.clone()),
            ca_dir: self.ca_dir.clone(),
            bypass_hosts: self.bypass_hosts.clone(),
            limits: CaptureLimits::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recording_proxy=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.config();
    let store = Arc::new(PacketStore::new(
        config.persist_path.clone(),
        config.limits.body_preview_cap,
    ));
    store.load();
    let rules = Arc::new(RuleEngine::new());
    let interceptor = TrafficInterceptor::new(
        rules.clone(),
        store.clone(),
        BypassList::new(config.bypass_hosts.clone()),
    );

    let mut ca = None;
    let engine: Arc<dyn ProxyEngine> = if args.intercept_tls {
        let authority = Arc::new(CertificateAuthority::open(&config.ca_dir)?);
        ca = Some(authority.clone());
        Arc::new(InterceptEngine::new(
            &config.listen_host,
            config.listen_port,
            authority,
            interceptor,
            config.limits.clone(),
        ))
    } else {
        Arc::new(PassthroughEngine::new(
            &config.listen_host,
            config.listen_port,
            interceptor,
            config.limits.clone(),
        ))
    };

    let proxy = ProxyServer::new(engine);
    let port = proxy.ensure_started().await?;
    println!(
        "Proxy listening on http://{}:{} ({})",
        config.listen_host,
        port,
        if args.intercept_tls {
            "TLS interception"
        } else {
            "passthrough"
        }
    );
    println!(
        "Control API on http://{}:{}",
        config.listen_host, config.api_port
    );

    let state = AppState {
        proxy,
        store: store.clone(),
        rules,
        replay: Arc::new(ReplayClient::new(store)?),
        ca,
    };
    api::serve(state, &config.listen_host, config.api_port).await?;

    Ok(())
}
