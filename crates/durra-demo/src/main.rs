// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded durra example - an order flow persisted in SQLite.
//!
//! The flow charges a card behind a shared semaphore, then waits for a
//! shipment message. The first invocation suspends; the message sent
//! afterwards resumes it.
//!
//! ```text
//! DURRA_DATABASE_URL=sqlite:durra-demo.db?mode=rwc cargo run -p durra-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use durra_core::{Config, FunctionStore, SqliteStore, Status};
use durra_runtime::{FlowError, FlowResult, InvocationError, Registry, Settings, Workflow};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    amount_cents: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Receipt {
    order_id: String,
    charge_id: String,
    shipped: bool,
}

async fn process_order(order: Order, workflow: Workflow) -> FlowResult<Receipt> {
    let gateway = workflow.semaphore("payments", "gateway", 2).acquire().await?;
    let charge_id: String = workflow
        .effect()
        .capture("charge", || async {
            info!(order_id = %order.id, amount_cents = order.amount_cents, "Charging card");
            Ok::<_, FlowError>(format!("ch_{}", Uuid::new_v4().simple()))
        })
        .await?;
    gateway.release().await?;

    let shipped = workflow
        .messages()
        .of_type::<String>()
        .filter(|event| event.as_str() == "shipped")
        .timeout("shipping", Duration::from_secs(30))
        .first_or_none()
        .await?
        .is_some();

    Ok(Receipt {
        order_id: order.id,
        charge_id,
        shipped,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("durra_runtime=info,durra_demo=info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(database_url = %config.database_url, "Configuration loaded");

    let store: Arc<dyn FunctionStore> = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let registry = Registry::new(store, Settings::from(&config));
    let orders = registry.register("orders", process_order)?;

    let instance = format!("order-{}", Uuid::new_v4().simple());
    let order = Order {
        id: instance.clone(),
        amount_cents: 4_990,
    };

    match orders.invoke(&instance, order).await {
        Ok(receipt) => info!(?receipt, "Order finished inline"),
        Err(InvocationError::Suspended) => info!(instance = %instance, "Order waiting for shipment"),
        Err(e) => return Err(e.into()),
    }

    orders
        .send_message(&instance, &"shipped".to_string(), Some("shipment-1"))
        .await?;

    let receipt = loop {
        let panel = orders
            .control_panel(&instance)
            .await?
            .ok_or_else(|| anyhow!("order {} disappeared", instance))?;
        match panel.status() {
            Status::Succeeded => break panel.result()?,
            Status::Failed => bail!("order failed: {:?}", panel.failure()),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    };
    info!(?receipt, "Order completed");

    if !registry.shutdown(Duration::from_secs(10)).await {
        error!("Shutdown timed out with flows still running");
    }
    Ok(())
}
