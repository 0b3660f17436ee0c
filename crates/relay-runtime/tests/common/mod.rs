//! Shared harness for the runtime integration tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_core::bus::{EventBus, InMemoryEventBus};
use relay_core::error::CoreError;
use relay_core::registry::{handler_fn, Registry};
use relay_core::spec::WorkKind;
use relay_core::RelayConfig;
use relay_runtime::{Dispatcher, LocalExecutor};
use relay_storage::{InMemoryLedger, Ledger};

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub registry: Arc<Registry>,
    pub bus: Arc<InMemoryEventBus>,
    pub executor: LocalExecutor,
    pub dispatcher: Arc<Dispatcher>,
    pub config: RelayConfig,
}

/// Build a harness with the default config and the standard test handlers.
pub fn harness() -> Harness {
    harness_with(RelayConfig::default())
}

/// Build a harness with a custom config.
pub fn harness_with(config: RelayConfig) -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let registry = Arc::new(Registry::new());
    let bus = Arc::new(InMemoryEventBus::new());

    register_standard_handlers(&registry);

    let ledger_dyn: Arc<dyn Ledger> = ledger.clone();
    let bus_dyn: Arc<dyn EventBus> = bus.clone();

    let executor = LocalExecutor::new(
        Arc::clone(&ledger_dyn),
        Arc::clone(&registry),
        Arc::clone(&bus_dyn),
        &config,
    );
    let dispatcher = Dispatcher::new(
        ledger_dyn,
        Arc::clone(&registry),
        Arc::new(executor.clone()),
        bus_dyn,
    );

    Harness {
        ledger,
        registry,
        bus,
        executor,
        dispatcher,
        config,
    }
}

/// Handlers most tests need: arithmetic, deterministic failure, and a slow
/// task for cancellation/timeout scenarios.
fn register_standard_handlers(registry: &Registry) {
    registry
        .register(
            WorkKind::Task,
            "add",
            handler_fn(|params| async move {
                let a = params["a"].as_i64().unwrap_or(0);
                let b = params["b"].as_i64().unwrap_or(0);
                Ok(json!({"a": a, "b": b, "result": a + b}))
            }),
        )
        .unwrap();

    registry
        .register(
            WorkKind::Task,
            "fail",
            handler_fn(|params| async move {
                let message = params["message"].as_str().unwrap_or("boom").to_string();
                Err(CoreError::internal(message))
            }),
        )
        .unwrap();

    registry
        .register(
            WorkKind::Task,
            "slow",
            handler_fn(|params| async move {
                let millis = params["millis"].as_u64().unwrap_or(5_000);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(json!({"slept_ms": millis}))
            }),
        )
        .unwrap();

    registry
        .register(
            WorkKind::Operation,
            "etl",
            handler_fn(|_params| async move { Ok(json!({"rows": 1})) }),
        )
        .unwrap();
}
