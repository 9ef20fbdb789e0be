use dotenvy::dotenv;
use proxy_provisioner::{config::Config, startup::HttpServer, state::setup};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenv().ok();
    color_eyre::install()?;
    config_tracing();

    // Already installed when another crate picked a provider first
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Config::load()?;
    let state = setup(&config).await?;

    HttpServer::new(&config, state).await?.run().await
}

fn config_tracing() {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "1")
    }

    use tracing::Level;
    use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

    let tracing_layer = tracing_subscriber::fmt::layer();
    let filter = filter::Targets::new()
        .with_target("hyper::proto", Level::INFO)
        .with_target("instant_acme", Level::INFO)
        .with_target("tower_http::trace", Level::DEBUG)
        .with_default(Level::DEBUG);

    tracing_subscriber::registry()
        .with(tracing_layer)
        .with(filter)
        .init();
}
