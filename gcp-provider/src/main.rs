use gcp_provider_core::ProviderConfig;
use std::env;
use std::error::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let args = cmdline::Args::from(&matches);
    setup_tracing::register(args.log_format_json);

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Installing default CryptoProvider");

    if let Err(e) = run(args).await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run(args: cmdline::Args) -> Result<(), Box<dyn Error>> {
    let mut config = ProviderConfig::load(env!("PROVIDER_VERSION"), env::vars())?;
    args.apply(&mut config);

    let kube = gcp_provider_core::auth::kube_client(config.kubeconfig.as_deref()).await;

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = gcp_provider_core::run(config, kube, cln_token).await;

    // the provider may have stopped on its own, e.g. the socket could not be bound
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    result.map_err(|e| format!("Error running provider: {e:?}"))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
