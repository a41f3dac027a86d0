// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helpers for unit tests that drive a [`Workflow`] without a registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use durra_core::{FlowId, InMemoryStore};

use crate::context::Context;
use crate::lease::LeaseState;
use crate::settings::Settings;
use crate::time;
use crate::workflow::Workflow;

pub(crate) const FLOW_TYPE: &str = "unit";

pub(crate) fn context(settings: Settings) -> Arc<Context> {
    Arc::new(Context::new(Arc::new(InMemoryStore::new()), settings))
}

/// Create an `Executing` instance at epoch 0 and bind a workflow to it.
pub(crate) async fn workflow(ctx: &Arc<Context>, instance: &str) -> Workflow {
    let flow_id = FlowId::new(FLOW_TYPE, instance);
    let lease = time::from_now(Duration::from_secs(60));
    assert!(
        ctx.store
            .create_function(&flow_id, None, lease, None, Utc::now())
            .await
            .unwrap()
    );
    Workflow::load(flow_id, 0, ctx.clone(), Arc::new(LeaseState::new(lease)), Vec::new())
        .await
        .unwrap()
}

/// A fresh run of the same epoch, as after a rejected suspend.
pub(crate) async fn reload(workflow: &Workflow) -> Workflow {
    Workflow::load(
        workflow.flow_id().clone(),
        workflow.epoch(),
        workflow.context().clone(),
        workflow.lease_state().clone(),
        workflow.held(),
    )
    .await
    .unwrap()
}

/// Let another executor win the next epoch.
pub(crate) async fn take_over(workflow: &Workflow) {
    let epoch = workflow.epoch();
    assert!(
        workflow
            .context()
            .store
            .try_to_become_leader(
                workflow.flow_id(),
                epoch,
                epoch + 1,
                time::from_now(Duration::from_secs(60)),
            )
            .await
            .unwrap()
    );
    workflow.lease_state().mark_superseded();
}
