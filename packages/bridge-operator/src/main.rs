use std::sync::Arc;

use bridge_chains::{ChainAddress, ChainRpc, ContractCaller, EvmRpcClient, TxSigner, WalletHttpClient};
use eyre::WrapErr;
use tokio::sync::mpsc;

use bridge_operator::api::{self, AppState};
use bridge_operator::claim::{ClaimEngine, ClaimSweeper};
use bridge_operator::config::Config;
use bridge_operator::db::{self, PgLedger};
use bridge_operator::governance::SignerCell;
use bridge_operator::metrics;
use bridge_operator::orchestrator::activities::{BridgeActivities, ChainCallers};
use bridge_operator::orchestrator::{flows, EngineBuilder, PgFlowJournal};
use bridge_operator::tokens::TokenMap;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting WEL/ETH bridge");

    let config = Config::load()?;
    tracing::info!(
        eth_chain_id = config.eth.chain_id,
        eth_rpc_urls = config.eth.rpc_urls.len(),
        wel_rpc_urls = config.wel.rpc_urls.len(),
        "Configuration loaded"
    );

    let pool = db::create_pool(config.database.url.expose(), config.database.max_connections).await?;
    tracing::info!("Database connected");
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let tokens = Arc::new(TokenMap::load(&config.bridge.tokens_map_path)?);

    let eth_rpc: Arc<dyn ChainRpc> = Arc::new(
        EvmRpcClient::new(config.eth.rpc_urls.clone(), config.eth.chain_id)
            .wrap_err("Failed to create ETH RPC client")?,
    );
    let wel_rpc: Arc<dyn ChainRpc> = Arc::new(
        WalletHttpClient::new(config.wel.rpc_urls.clone(), config.wel.address_prefix)
            .wrap_err("Failed to create WEL wallet client")?,
    );
    let prefix = config.wel.address_prefix;
    let chains = ChainCallers {
        eth_bridge: ContractCaller::new(
            eth_rpc.clone(),
            ChainAddress::parse_hex(&config.eth.bridge_address)?,
            config.eth.gas_limit,
        ),
        eth_governance: ContractCaller::new(
            eth_rpc,
            ChainAddress::parse_hex(&config.eth.governance_address)?,
            config.eth.gas_limit,
        ),
        wel_bridge: ContractCaller::new(
            wel_rpc.clone(),
            ChainAddress::parse(&config.wel.bridge_address, prefix)?,
            config.wel.fee_limit,
        ),
        wel_governance: ContractCaller::new(
            wel_rpc,
            ChainAddress::parse(&config.wel.governance_address, prefix)?,
            config.wel.fee_limit,
        ),
        wel_address_prefix: prefix,
    };

    let initial_signer = match &config.bridge.admin_private_key {
        Some(key) => {
            let signer = TxSigner::from_hex(key.expose()).wrap_err("Invalid ADMIN_PRIVATE_KEY")?;
            tracing::info!(address = %signer.address().to_hex(), "Administrative signer loaded");
            Some(signer)
        }
        None => {
            tracing::warn!("No ADMIN_PRIVATE_KEY configured; claims and governance will fail until a signer is set");
            None
        }
    };
    let signer = Arc::new(SignerCell::new(initial_signer));

    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let journal = Arc::new(PgFlowJournal::new(pool));
    let claims = Arc::new(ClaimEngine::new(
        ledger.clone(),
        chrono::Duration::seconds(config.bridge.claim_request_ttl_secs),
    ));

    let activities = Arc::new(BridgeActivities::new(
        claims.clone(),
        ledger.clone(),
        tokens,
        chains,
        signer,
        config.eth.treasury_address.clone(),
    ));
    let builder = flows::register(
        EngineBuilder::new(journal.clone()),
        config.bridge.bridge_queue_workers,
        config.bridge.governance_queue_workers,
    );
    let engine = activities.register(builder).build();

    // Create shutdown channels
    let (engine_tx, engine_rx) = mpsc::channel::<()>(1);
    let (sweeper_tx, sweeper_rx) = mpsc::channel::<()>(1);
    let (api_tx, api_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = engine_tx.send(()).await;
        let _ = sweeper_tx.send(()).await;
        let _ = api_tx.send(()).await;
    });

    let sweeper = (config.bridge.sweep_interval_secs > 0).then(|| {
        let sweeper = ClaimSweeper::new(
            claims,
            std::time::Duration::from_secs(config.bridge.sweep_interval_secs),
        );
        tokio::spawn(sweeper.run(sweeper_rx))
    });

    let state = AppState {
        ledger,
        journal,
    };
    let api_config = config.api.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = api::start_server(&api_config.bind_address, api_config.port, state, api_rx).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    metrics::UP.set(1.0);
    tracing::info!("Bridge initialized, starting flow engine");

    if let Err(e) = engine.run(engine_rx).await {
        tracing::error!(error = %e, "Flow engine error");
    }
    metrics::UP.set(0.0);

    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    let _ = api.await;

    tracing::info!("WEL/ETH bridge stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_operator=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
