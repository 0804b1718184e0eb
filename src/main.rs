use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webrocket::{BrokerResult, Config, Context};

#[tokio::main]
async fn main() {
    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "webrocket=info,tower_http=warn".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("WebRocket broker starting...");

    let config = Config::from_env();
    let context = Context::new(config.broker.clone());

    // Boot vhosts: log each generated secret so workers can be provisioned.
    for path in &config.vhosts {
        match context.add_vhost(path).await {
            Ok(vhost) => {
                info!(vhost = %path, secret = %vhost.secret(), "vhost ready");
            }
            Err(e) => {
                tracing::error!(vhost = %path, error = %e, "failed to create boot vhost");
                std::process::exit(1);
            }
        }
    }

    let frontend = context.websocket_endpoint(&config.frontend_host, config.frontend_port);
    let backend = context.backend_endpoint(&config.backend_host, config.backend_port);

    let tls = config
        .tls_pair()
        .map(|(cert, key)| (cert.clone(), key.clone()));

    let mut frontend_task = tokio::spawn({
        let frontend = frontend.clone();
        let tls = tls.clone();
        async move {
            match tls {
                Some((cert, key)) => frontend.listen_and_serve_tls(cert, key).await,
                None => frontend.listen_and_serve().await,
            }
        }
    });

    let mut backend_task = tokio::spawn({
        let backend = backend.clone();
        async move {
            match tls {
                Some((cert, key)) => backend.listen_and_serve_tls(cert, key).await,
                None => backend.listen_and_serve().await,
            }
        }
    });

    // Run until SIGINT; an endpoint exiting on its own is a startup failure
    // (typically a bind error) and terminates the process non-zero.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = &mut frontend_task => endpoint_failed("websocket", result),
        result = &mut backend_task => endpoint_failed("backend", result),
    }

    context.shutdown().await;
    info!("WebRocket broker stopped");
}

fn endpoint_failed(name: &str, result: Result<BrokerResult<()>, JoinError>) -> ! {
    match result {
        Ok(Err(e)) => tracing::error!(endpoint = name, error = %e, "endpoint failed"),
        Ok(Ok(())) => tracing::error!(endpoint = name, "endpoint exited unexpectedly"),
        Err(e) => tracing::error!(endpoint = name, error = ?e, "endpoint task panicked"),
    }
    std::process::exit(1);
}
