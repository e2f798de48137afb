//! One-shot cleanup: cancel every open order on the symbol over REST, then
//! close any position with a reduce-only market order.

use std::time::Duration;

use tracing::{info, warn};

use standx_mm::logging;
use standx_mm::standx::api::{ApiConfig, StandxApi};
use standx_mm::standx::auth::{Credential, Signer, SignerConfig};
use standx_mm::standx::engine::StrategyConfig;
use standx_mm::standx::types::{to_decimal, OrderRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let account = std::env::var("MM_ACCOUNT_NAME").ok().filter(|s| !s.trim().is_empty());
    let prefix = match account.as_deref() {
        Some(a) => format!("{}_flatten", a.trim()),
        None => "flatten".to_string(),
    };
    let _log_guard = logging::init(Some(prefix.as_str()))?;

    let cfg = StrategyConfig::from_env();
    let symbol = cfg.symbol.clone();
    info!("🧯 Flatten {}", symbol);

    let signer = Signer::new(SignerConfig::from_env(), Credential::from_env()?)?;
    let identity = signer.authenticate().await?;
    let api = StandxApi::new(&ApiConfig::from_env(), identity)?;

    match api.query_symbol_price(&symbol).await {
        Ok(p) => info!(
            "💲 {} mark={:?} index={:?} mid={:?} last={:?}",
            symbol, p.mark_price, p.index_price, p.mid_price, p.last_price
        ),
        Err(e) => warn!("💲 price query failed: {}", e),
    }

    let cancelled = api.cancel_all(&symbol).await?;
    info!("🧹 {} cancel(s) accepted", cancelled);

    let position = api
        .query_positions(Some(&symbol))
        .await?
        .into_iter()
        .find(|p| p.symbol == symbol && !p.is_flat());
    let Some(position) = position else {
        info!("📍 {} already flat", symbol);
        return Ok(());
    };

    let side = position.closing_side();
    let qty = to_decimal(position.qty.abs(), cfg.qty_decimals)
        .filter(|q| !q.is_zero())
        .ok_or_else(|| anyhow::anyhow!("position {} below qty precision", position.qty))?;
    let req = OrderRequest::reduce_only_market(&symbol, side, qty)
        .with_margin(position.margin_mode.clone(), position.leverage);
    let cl_ord_id = uuid::Uuid::new_v4().as_simple().to_string();
    let ack = api.new_order(&req, &cl_ord_id).await?;
    info!("📤 {} {} reduce-only market sent | code={} {}", side, qty, ack.code, ack.message);
    match api.query_order(None, Some(&cl_ord_id)).await {
        Ok(Some(o)) => info!("📋 close order {:?} filled {}/{}", o.status, o.filled_qty, o.qty),
        Ok(None) => info!("📋 close order {} not listed yet", cl_ord_id),
        Err(e) => warn!("📋 order query failed: {}", e),
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    match api.query_positions(Some(&symbol)).await {
        Ok(ps) => match ps.into_iter().find(|p| p.symbol == symbol && !p.is_flat()) {
            Some(p) => warn!("📍 position still open: qty={}", p.qty),
            None => info!("📍 {} flat", symbol),
        },
        Err(e) => warn!("📍 position re-check failed: {}", e),
    }
    Ok(())
}
