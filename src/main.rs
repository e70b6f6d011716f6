use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use chainpay::{
    chain::EthersChainClient,
    config::Config,
    handlers::{
        create_invoice, delete_invoice, get_balance, get_invoice, health_check, list_invoices,
        root, AppState,
    },
    services::{ChainObserver, SweepEngine, WalletService},
    store::{InvoiceStore as _, SqliteInvoiceStore},
};
use ethers::signers::Signer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting chainpay v{}", env!("CARGO_PKG_VERSION"));

    // Initialize services
    let wallet = Arc::new(WalletService::new(
        config.mnemonic.clone(),
        config.chain_id,
        config.sweep_contract,
    )?);
    let treasury_wallet = wallet.treasury()?;
    let treasury = treasury_wallet.address();

    let chain = Arc::new(
        EthersChainClient::new(&config.rpc_url, treasury_wallet, config.chain_id).await?,
    );
    let store = Arc::new(SqliteInvoiceStore::open(
        PathBuf::from(&config.db_path),
        config.start_block,
    )?);
    tracing::info!(
        "Invoice store ready at {}, cursor {}",
        store.path().display(),
        store.cursor()?
    );

    // Periodic tasks
    let observer = Arc::new(ChainObserver::new(
        chain.clone(),
        store.clone(),
        config.tokens.clone(),
    ));
    tokio::spawn(
        observer.run(Duration::from_secs(config.observer_interval_secs)),
    );

    let sweeper = Arc::new(SweepEngine::new(
        chain.clone(),
        store.clone(),
        wallet.clone(),
        treasury,
        config.token_addresses(),
    ));
    tokio::spawn(sweeper.run(Duration::from_secs(config.sweep_interval_secs)));

    // Build router
    let app_state = AppState {
        store,
        chain,
        wallet,
        treasury,
        tokens: config.tokens.clone(),
        invoice_ttl_ms: (config.invoice_ttl_secs * 1_000) as i64,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/balance", get(get_balance))
        .route("/invoice", post(create_invoice).get(list_invoices))
        .route(
            "/invoice/:invoice_id",
            get(get_invoice).delete(delete_invoice),
        )
        .with_state(app_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("Shutting down gracefully...");
}
