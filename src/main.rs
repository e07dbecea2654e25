//! Mock Push Gateway
//!
//! A TLS server that:
//! - Accepts push protocol (h2) connections
//! - Classifies clients as certificate or token authenticated
//! - Serves registries seeded from a fixtures file

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use mock_push_gateway::config::{self, Fixtures, ServerSettings};
use mock_push_gateway::{tls, MockPushServer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let settings = ServerSettings::from_args(&args)?;

    log::info!("Mock push gateway starting...");
    log::info!("  Port:      {}", settings.port);
    log::info!("  Cert:      {}", settings.cert_path.display());
    log::info!("  Key:       {}", settings.key_path.display());
    log::info!(
        "  Client CA: {}",
        settings
            .client_ca_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none (token authentication only)".to_string())
    );

    let cert_chain = config::load_certs(&settings.cert_path)?;
    let key = config::load_private_key(&settings.key_path)?;
    let client_roots = match &settings.client_ca_path {
        Some(path) => Some(config::load_client_roots(path)?),
        None => None,
    };

    let mut server = MockPushServer::builder(tls::server_config(cert_chain, key, client_roots)?)
        .build()?;

    if let Some(path) = &settings.fixtures_path {
        Fixtures::load(path)?.apply(server.state())?;
    }

    let addr = server.start(settings.port)?.wait()?;
    log::info!("Ready on {}", addr);

    // Block until SIGINT/SIGTERM
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(signal) = signals.forever().next() {
        log::info!("Received signal {}, shutting down", signal);
    }

    server.shutdown().wait()?;
    Ok(())
}
