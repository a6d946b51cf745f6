mod common;

use std::time::Duration;

use common::{add_backend, base_config, generation_request, mock_backend::MockBackend};
use dialogue_gateway::{
    adapters::{AdapterDescriptor, AdapterError, AdapterState},
    app_context::AppContext,
    core::{GatewayError, Tier},
};

fn descriptor(name: &str, footprint: u64) -> AdapterDescriptor {
    AdapterDescriptor {
        name: name.to_string(),
        base_model: "base-7b".to_string(),
        path: format!("archetypes/{name}/personality.bin"),
        rank: 16,
        alpha: 32.0,
        memory_footprint_bytes: footprint,
    }
}

async fn context_with_backend(
    backend: &MockBackend,
    budget_bytes: u64,
) -> std::sync::Arc<AppContext> {
    let mut config = base_config();
    config.adapters.default_memory_budget_bytes = budget_bytes;
    add_backend(&mut config, Tier::Interactive, "int-0", &backend.url());
    AppContext::from_config(config).unwrap()
}

#[tokio::test]
async fn test_load_and_unload_walk_the_state_machine() {
    let backend = MockBackend::start().await;
    let ctx = context_with_backend(&backend, 1024).await;

    ctx.adapters.register(descriptor("vampire", 256)).unwrap();
    ctx.adapters.load("vampire", "int-0").await.unwrap();

    let status = ctx.adapters.status("vampire").unwrap();
    assert_eq!(status.instances["int-0"], AdapterState::Loaded);
    assert!(ctx.adapters.is_loaded("vampire", "int-0"));
    assert_eq!(backend.commands(), vec!["load:vampire"]);

    ctx.adapters.unload("vampire", "int-0").await.unwrap();
    let status = ctx.adapters.status("vampire").unwrap();
    assert_eq!(status.instances["int-0"], AdapterState::Registered);
    assert_eq!(backend.commands(), vec!["load:vampire", "unload:vampire"]);
}

#[tokio::test]
async fn test_double_load_is_rejected() {
    let backend = MockBackend::start().await;
    let ctx = context_with_backend(&backend, 1024).await;

    ctx.adapters.register(descriptor("vampire", 256)).unwrap();
    ctx.adapters.load("vampire", "int-0").await.unwrap();
    assert!(matches!(
        ctx.adapters.load("vampire", "int-0").await,
        Err(AdapterError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_failed_command_traps_in_failed_state() {
    let backend = MockBackend::start().await;
    backend.set_behavior(|b| b.adapter_command_status = 500).await;
    let ctx = context_with_backend(&backend, 1024).await;

    ctx.adapters.register(descriptor("vampire", 256)).unwrap();
    assert!(matches!(
        ctx.adapters.load("vampire", "int-0").await,
        Err(AdapterError::CommandFailed { .. })
    ));
    let status = ctx.adapters.status("vampire").unwrap();
    assert_eq!(status.instances["int-0"], AdapterState::Failed);

    // No automatic retry out of Failed; a load attempt is refused.
    backend.set_behavior(|b| b.adapter_command_status = 200).await;
    assert!(matches!(
        ctx.adapters.load("vampire", "int-0").await,
        Err(AdapterError::InvalidState { .. })
    ));

    // Explicit operator re-registration clears the trap.
    ctx.adapters.register(descriptor("vampire", 256)).unwrap();
    ctx.adapters.load("vampire", "int-0").await.unwrap();
    assert!(ctx.adapters.is_loaded("vampire", "int-0"));
}

#[tokio::test]
async fn test_hot_swap_make_before_break_when_budget_allows() {
    let backend = MockBackend::start().await;
    // Budget fits both artifacts: the new adapter loads before the old
    // one unloads.
    let ctx = context_with_backend(&backend, 1024).await;

    ctx.adapters.register(descriptor("vampire-v1", 256)).unwrap();
    ctx.adapters.register(descriptor("vampire-v2", 256)).unwrap();
    ctx.adapters.load("vampire-v1", "int-0").await.unwrap();

    ctx.adapters
        .hot_swap("vampire-v1", "vampire-v2", "int-0")
        .await
        .unwrap();

    assert_eq!(
        backend.commands(),
        vec!["load:vampire-v1", "load:vampire-v2", "unload:vampire-v1"]
    );
    assert!(ctx.adapters.is_loaded("vampire-v2", "int-0"));
    assert!(!ctx.adapters.is_loaded("vampire-v1", "int-0"));
}

#[tokio::test]
async fn test_hot_swap_break_before_make_when_budget_is_tight() {
    let backend = MockBackend::start().await;
    // Budget holds only one artifact at a time.
    let ctx = context_with_backend(&backend, 300).await;

    ctx.adapters.register(descriptor("vampire-v1", 256)).unwrap();
    ctx.adapters.register(descriptor("vampire-v2", 256)).unwrap();
    ctx.adapters.load("vampire-v1", "int-0").await.unwrap();

    ctx.adapters
        .hot_swap("vampire-v1", "vampire-v2", "int-0")
        .await
        .unwrap();

    assert_eq!(
        backend.commands(),
        vec!["load:vampire-v1", "unload:vampire-v1", "load:vampire-v2"]
    );
    assert!(ctx.adapters.is_loaded("vampire-v2", "int-0"));
}

#[tokio::test]
async fn test_instance_is_excluded_for_the_whole_swap_window() {
    let backend = MockBackend::start().await;
    backend
        .set_behavior(|b| b.adapter_command_delay = Duration::from_millis(250))
        .await;
    let ctx = context_with_backend(&backend, 1024).await;

    ctx.adapters.register(descriptor("vampire-v1", 256)).unwrap();
    ctx.adapters.register(descriptor("vampire-v2", 256)).unwrap();
    ctx.adapters.load("vampire-v1", "int-0").await.unwrap();

    let swap_ctx = ctx.clone();
    let swap = tokio::spawn(async move {
        swap_ctx
            .adapters
            .hot_swap("vampire-v1", "vampire-v2", "int-0")
            .await
    });

    // While the swap is in flight the only instance in the tier is
    // ineligible, with or without an adapter requirement.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let instance = ctx.registry.get("int-0").unwrap();
    assert!(instance.is_swapping());
    assert!(matches!(
        ctx.router.route(&generation_request()).await,
        Err(GatewayError::TierUnavailable { .. })
    ));
    let mut with_adapter = generation_request();
    with_adapter.adapter = Some("vampire-v1".to_string());
    assert!(matches!(
        ctx.router.route(&with_adapter).await,
        Err(GatewayError::TierUnavailable { .. })
    ));

    swap.await.unwrap().unwrap();
    assert!(!instance.is_swapping());

    // Swap done: plain traffic and the new adapter are served again.
    ctx.router.route(&generation_request()).await.unwrap();
    let mut with_new = generation_request();
    with_new.adapter = Some("vampire-v2".to_string());
    let result = ctx.router.route(&with_new).await.unwrap();
    assert_eq!(result.backend_id, "int-0");
}

#[tokio::test]
async fn test_failed_swap_clears_exclusion_and_keeps_old_adapter() {
    let backend = MockBackend::start().await;
    let ctx = context_with_backend(&backend, 1024).await;

    ctx.adapters.register(descriptor("vampire-v1", 256)).unwrap();
    ctx.adapters.register(descriptor("vampire-v2", 256)).unwrap();
    ctx.adapters.load("vampire-v1", "int-0").await.unwrap();

    // Make-before-break: the new load fails, the old adapter stays
    // loaded and the instance returns to rotation.
    backend.set_behavior(|b| b.adapter_command_status = 500).await;
    assert!(matches!(
        ctx.adapters.hot_swap("vampire-v1", "vampire-v2", "int-0").await,
        Err(AdapterError::CommandFailed { .. })
    ));

    let instance = ctx.registry.get("int-0").unwrap();
    assert!(!instance.is_swapping());
    assert!(ctx.adapters.is_loaded("vampire-v1", "int-0"));
    let status = ctx.adapters.status("vampire-v2").unwrap();
    assert_eq!(status.instances["int-0"], AdapterState::Failed);

    backend.set_behavior(|b| b.adapter_command_status = 200).await;
    let mut with_old = generation_request();
    with_old.adapter = Some("vampire-v1".to_string());
    ctx.router.route(&with_old).await.unwrap();
}

#[tokio::test]
async fn test_swaps_on_same_instance_are_serialized() {
    let backend = MockBackend::start().await;
    backend
        .set_behavior(|b| b.adapter_command_delay = Duration::from_millis(150))
        .await;
    let ctx = context_with_backend(&backend, 4096).await;

    for name in ["a", "b", "c"] {
        ctx.adapters.register(descriptor(name, 64)).unwrap();
    }
    ctx.adapters.load("a", "int-0").await.unwrap();

    // Two swaps race on one instance; serialization means the second
    // observes the first's final state and fails cleanly rather than
    // interleaving commands.
    let ctx1 = ctx.clone();
    let first = tokio::spawn(async move { ctx1.adapters.hot_swap("a", "b", "int-0").await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let ctx2 = ctx.clone();
    let second = tokio::spawn(async move { ctx2.adapters.hot_swap("a", "c", "int-0").await });

    assert!(first.await.unwrap().is_ok());
    assert!(matches!(
        second.await.unwrap(),
        Err(AdapterError::InvalidState { .. })
    ));
    assert!(ctx.adapters.is_loaded("b", "int-0"));
}
