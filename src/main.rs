mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use courier_broker::{
    serve_connection, AsyncBlockDispatcher, AuthorizationCache, BrokerBackendProcessing,
    InProcessBlockDispatcher, SecurityPrincipal, ServeOptions, StaticAuthorizationService,
};
use courier_data::BlockPool;
use courier_tasks::{ControlToken, ExecutionQueue, QueueMode};

use cli::{Cli, Commands};
use config::BrokerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Serve { listen } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            run_serve(config).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn build_authorization_cache(
    config: &BrokerConfig,
) -> anyhow::Result<Option<Arc<AuthorizationCache>>> {
    let Some(authorization) = &config.authorization else {
        return Ok(None);
    };

    let mut service = StaticAuthorizationService::new(&authorization.token_type);
    for entry in &authorization.principals {
        service = service.with_principal(
            &entry.token,
            SecurityPrincipal {
                secure_identity: entry.sid.clone(),
                given_name: entry.given_name.clone(),
                family_name: entry.family_name.clone(),
                email: entry.email.clone(),
                type_id: entry.type_id.clone(),
            },
        );
    }

    let cache = Arc::new(AuthorizationCache::new(Arc::new(service)));
    cache.configure_freshness_interval(authorization.freshness()?);
    Ok(Some(cache))
}

fn build_tls_acceptor(config: &BrokerConfig) -> anyhow::Result<Option<tokio_rustls::TlsAcceptor>> {
    let Some(tls) = &config.tls else {
        return Ok(None);
    };

    // Pin the crypto provider before any rustls config is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(&tls.cert_path)
            .with_context(|| format!("cannot open certificate '{}'", tls.cert_path))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("cannot parse certificate chain")?;

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&tls.key_path)
            .with_context(|| format!("cannot open private key '{}'", tls.key_path))?,
    ))
    .context("cannot parse private key")?
    .context("no private key found")?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;

    Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(
        server_config,
    ))))
}

async fn run_serve(config: BrokerConfig) -> anyhow::Result<()> {
    let token = ControlToken::new();
    let queue = ExecutionQueue::with_capacity(QueueMode::KeepNone, config.queue_concurrency);
    let pool = BlockPool::default();

    let dispatcher = Arc::new(InProcessBlockDispatcher::new(config.outbound_queue_capacity));
    let dispatcher_dyn: Arc<dyn AsyncBlockDispatcher> = dispatcher.clone();

    let authorization_cache = build_authorization_cache(&config)?;
    let backend = Arc::new(BrokerBackendProcessing::new(authorization_cache));
    backend.set_dispatcher(&dispatcher_dyn);

    let tls_acceptor = build_tls_acceptor(&config)?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("cannot bind '{}'", config.listen_addr))?;
    info!(
        listen = %config.listen_addr,
        tls = tls_acceptor.is_some(),
        "broker is accepting connections"
    );

    let serve_options = ServeOptions {
        require_authentication: config.require_authentication,
        ..ServeOptions::default()
    };

    loop {
        let (stream, remote) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        info!(remote = %remote, "inbound connection");
        let backend = backend.clone();
        let dispatcher = dispatcher.clone();
        let queue = queue.clone();
        let pool = pool.clone();
        let token = token.clone();
        let options = serve_options.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let result = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve_connection(
                            tls_stream, backend, dispatcher, queue, pool, token, options,
                        )
                        .await
                    }
                    Err(e) => {
                        warn!(remote = %remote, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => {
                    serve_connection(stream, backend, dispatcher, queue, pool, token, options)
                        .await
                }
            };
            if let Err(err) = result {
                error!(remote = %remote, error = %err, "connection failed");
            }
        });
    }

    // Stop serving: cancel everything in flight, then drain the queue.
    token.request_cancel();
    queue.dispose().await;
    info!(active_peers = dispatcher.active_peers(), "broker stopped");
    Ok(())
}
