use papertrader::api::{self, AppState};
use papertrader::engine::{ModificationPipeline, SettlementPipeline};
use papertrader::pricing::{BinancePriceProvider, SimulatedPriceProvider};
use papertrader::{
    AccessDirectory, AutoCloseScheduler, Config, HttpAccessDirectory, PriceProvider, PriceResolver,
    Repository,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and dependencies
    let pool = match papertrader::init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let repo = Arc::new(Repository::new(pool));

    // The simulated provider at the end of the chain means settlement always
    // gets some price.
    let providers: Vec<Arc<dyn PriceProvider>> = vec![
        Arc::new(BinancePriceProvider::new(config.price_api_url.clone())),
        Arc::new(SimulatedPriceProvider::new()),
    ];
    let resolver = PriceResolver::new(providers, Duration::from_secs(config.price_timeout_secs));

    let access: Arc<dyn AccessDirectory> =
        Arc::new(HttpAccessDirectory::new(config.auth_api_url.clone()));
    let settlement = Arc::new(SettlementPipeline::new(repo.clone(), resolver));
    let modification = Arc::new(ModificationPipeline::new(repo.clone(), access.clone()));
    let scheduler = Arc::new(AutoCloseScheduler::new(settlement.clone()));

    if config.auto_close_interval_minutes > 0 {
        scheduler.start(config.auto_close_interval_minutes).await;
    }

    // Create router
    let app = api::create_router(AppState::new(
        repo,
        settlement,
        modification,
        scheduler,
        access,
    ));

    // Bind to address
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
