//! StandX quote keeper: two-sided quotes around mid, flat inventory,
//! balance-degraded spread.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use standx_mm::logging;
use standx_mm::notifier::TelegramNotifier;
use standx_mm::standx::api::{ApiConfig, StandxApi};
use standx_mm::standx::auth::{Credential, Signer, SignerConfig};
use standx_mm::standx::engine::{StrategyConfig, StrategyEngine};
use standx_mm::standx::stream::{AdapterConfig, StreamAdapter};

/// SIGINT or SIGTERM, whichever comes first.
async fn wait_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("⚠️ SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let account = std::env::var("MM_ACCOUNT_NAME")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let _log_guard = logging::init(account.as_deref())?;

    info!("═══════════════════════════════════════════════════");
    info!("  StandX Quote Keeper — WS-driven, balance-degraded");
    info!("═══════════════════════════════════════════════════");

    let mut strat_cfg = StrategyConfig::from_env();
    strat_cfg.validate()?;
    let symbol = strat_cfg.symbol.clone();
    let m = &strat_cfg.modes;
    info!(
        "📊 Config: symbol={} qty={} t1={} t2={} normal={:?} d1={:?} d2={:?}",
        symbol, strat_cfg.qty, m.threshold_1, m.threshold_2, m.normal, m.degraded_1, m.degraded_2
    );

    // ═══ Authenticate (fatal on failure) ═══
    let credential = Credential::from_env()
        .map_err(|e| anyhow::anyhow!("🚨 FATAL: credential config: {e}"))?;
    info!("🔑 Credential: {}", credential.kind());
    let signer = Signer::new(SignerConfig::from_env(), credential)?;
    let identity = signer
        .authenticate()
        .await
        .map_err(|e| anyhow::anyhow!("🚨 FATAL: authentication failed: {e}"))?;
    info!(
        "✅ Authenticated | session key {} | address {}",
        identity.public_key_b58(),
        identity.address().unwrap_or("-")
    );

    let api_cfg = ApiConfig::from_env();
    let api = StandxApi::new(&api_cfg, identity.clone())?;

    // ═══ Margin settings from the current position ═══
    match api.query_positions(Some(&symbol)).await {
        Ok(positions) => {
            if let Some(p) = positions.into_iter().find(|p| p.symbol == symbol) {
                info!(
                    "📍 {} position qty={} leverage={:?} margin={:?}",
                    symbol, p.qty, p.leverage, p.margin_mode
                );
                strat_cfg.leverage = p.leverage;
                strat_cfg.margin_mode = p.margin_mode;
            }
        }
        Err(e) if e.is_signature_rejected() => {
            anyhow::bail!("🚨 FATAL: venue rejected request signature: {e}. Check the host clock.");
        }
        Err(e) => warn!("⚠️ position query failed, placing without margin settings: {}", e),
    }

    let notifier = TelegramNotifier::from_env(account.as_deref().unwrap_or(&symbol));

    // ═══ Shutdown wiring ═══
    // Engine stops first and cancels over the live streams; streams stop after.
    let engine_shutdown = CancellationToken::new();
    let stream_shutdown = CancellationToken::new();
    {
        let token = engine_shutdown.clone();
        tokio::spawn(async move {
            wait_signal().await;
            warn!("🛑 Shutdown requested, finishing current iteration");
            token.cancel();
            wait_signal().await;
            error!("🛑 Second signal, exiting immediately");
            std::process::exit(130);
        });
    }

    let sweep_api = api.clone();
    let adapter = Arc::new(StreamAdapter::start(
        AdapterConfig::from_env(&symbol),
        identity,
        Some(api),
        notifier.clone(),
        stream_shutdown.clone(),
    ));

    let engine = StrategyEngine::new(strat_cfg, adapter.clone(), notifier);
    let stats = engine.run(engine_shutdown).await;
    info!("🎯 Engine finished after {} iterations", stats.iterations);

    // Placements whose outcome never arrived are invisible to the engine's
    // cancels; sweep whatever the venue still lists.
    match tokio::time::timeout(Duration::from_secs(10), sweep_api.cancel_all(&symbol)).await {
        Ok(Ok(0)) => info!("🧹 REST sweep: nothing left open"),
        Ok(Ok(n)) => warn!("🧹 REST sweep cancelled {} leftover order(s)", n),
        Ok(Err(e)) => warn!("🧹 REST sweep failed: {}", e),
        Err(_) => warn!("🧹 REST sweep timed out"),
    }

    stream_shutdown.cancel();
    match Arc::try_unwrap(adapter) {
        Ok(adapter) => adapter.join(Duration::from_secs(5)).await,
        Err(_) => warn!("📡 adapter still shared at exit"),
    }
    info!("👋 Bye");
    Ok(())
}
