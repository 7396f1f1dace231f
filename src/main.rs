//! IAP Reconcile simulator
//!
//! Runs a scripted purchase session against the in-memory vendor and prints
//! the resulting session state.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use iap_reconcile::{
    BillingConfig, BillingSession, InMemoryVendor, PurchaseState, ResponseCode, UiHandle,
    VendorOp,
};

/// IAP Reconcile simulator
#[derive(Parser, Debug)]
#[command(name = "iap-sim")]
#[command(version)]
#[command(about = "Simulate an in-app purchase session against an in-memory vendor")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Make the vendor refuse to connect
    #[arg(long)]
    fail_connect: bool,

    /// Print session metrics in Prometheus format
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            "iap_reconcile=debug,iap_sim=debug".into()
        } else {
            "info".into()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = BillingConfig::from_env().context("invalid billing configuration")?;
    let vendor = Arc::new(InMemoryVendor::with_default_catalog());
    if args.fail_connect {
        vendor.fail(VendorOp::Connect, ResponseCode::ServiceUnavailable, "simulated outage");
    }

    let session = BillingSession::new(vendor.clone(), config)?;
    tracing::info!("Starting billing session");

    match session.start().await {
        Ok(()) => run_scenario(&session, &vendor).await?,
        Err(e) => tracing::error!(error = %e, "Session failed to initialize"),
    }

    let state = session.state();
    println!("{}", serde_json::to_string_pretty(&state)?);
    if args.metrics {
        println!("{}", session.metrics().to_prometheus_format());
    }

    session.shutdown().await;
    Ok(())
}

/// Buy one non-consumable, one consumable, then cancel a third flow
async fn run_scenario(session: &BillingSession, vendor: &InMemoryVendor) -> anyhow::Result<()> {
    let ui = UiHandle::new("iap-sim");
    let products = session.state().products;
    let baseline = session.state().events_processed;

    for (token, id) in [("sim-1", "test1"), ("sim-2", "test3")] {
        let product = products
            .iter()
            .find(|p| p.id == id)
            .with_context(|| format!("product {id} missing from catalog"))?;
        session.purchase(&ui, product).await?;
        vendor.complete_purchase(token, [id], PurchaseState::Purchased);
    }
    vendor.push_update(ResponseCode::UserCanceled, None);

    session
        .wait_for(|state| state.events_processed >= baseline + 3)
        .await?;
    tracing::info!(
        purchased = session.is_purchased("test1"),
        "Scenario finished"
    );
    Ok(())
}
