use anyhow::{Context, Result};
use rp_portal::{config::Config, web};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting relying party");

    // Load configuration from environment
    let config = Config::load()?;
    tracing::info!(
        environment = ?config.environment,
        realm = %config.provider.realm,
        internal_realm_url = %config.provider.internal_realm_url(),
        external_realm_url = %config.provider.external_realm_url(),
        public_url = %config.public_url,
        "Configuration loaded"
    );

    // Discovery and JWKS go through the internal address; failure here aborts startup
    let state = rp_portal::bootstrap(config.clone()).await?;
    tracing::info!("Provider discovered and JWKS prefetched - readiness check will pass");

    let _sweeper = state
        .sessions()
        .clone()
        .spawn_sweeper(Duration::from_secs(config.session_sweep_interval_secs));

    let app = web::create_router(state);

    let bind_address = config.bind_address();
    match &config.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(&bind_address).await?;
            tracing::info!("Listening on http://{}", bind_address);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Some(tls) => {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            let rustls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to load TLS certificate {} / key {}",
                            tls.cert_path.display(),
                            tls.key_path.display()
                        )
                    })?;
            let addr: SocketAddr = bind_address
                .parse()
                .with_context(|| format!("Invalid bind address {}", bind_address))?;

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
            });

            tracing::info!("Listening on https://{}", bind_address);
            axum_server::bind_rustls(addr, rustls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
