mod common;

use std::time::Duration;

use anywhere_mcp::config::LifecycleSettings;
use anywhere_mcp::protocol::{Request, codes};
use anywhere_types::SessionState;
use common::{
    FAILING_INSTALL, descriptor, error_code, eventually, first_text, gateway, gateway_with, request, result,
    test_settings,
};
use futures_util::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn whoami(provider: &str) -> serde_json::Value {
    json!({"name": "whoami", "arguments": {"provider": provider}})
}

#[tokio::test]
async fn concurrent_first_calls_share_one_session() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    let calls = (0..8).map(|_| result(router, "tools/call", whoami("alpha")));
    let identities: Vec<String> = join_all(calls).await.iter().map(first_text).collect();

    assert!(identities.iter().all(|identity| identity == "alpha#1"));
    assert_eq!(gateway.runtime.launches("alpha"), 1);
    let sessions = router.manager().sessions_snapshot();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Idle);
    assert_eq!(sessions[0].leases, 0);
}

#[tokio::test]
async fn warm_sessions_are_reused() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    for _ in 0..3 {
        assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#1");
    }
    assert_eq!(gateway.runtime.launches("alpha"), 1);
    assert_eq!(router.manager().housekeeping().await, 0);
}

#[tokio::test]
async fn idle_sessions_expire() {
    let mut settings = test_settings();
    settings.lifecycle = LifecycleSettings {
        idle_timeout: Duration::from_millis(100),
        ..settings.lifecycle
    };
    let gateway = gateway_with(vec![descriptor("alpha")], settings).await;
    let router = &gateway.router;

    assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#1");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(router.manager().housekeeping().await, 1);
    assert!(router.manager().sessions_snapshot().is_empty());

    assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#2");
    assert_eq!(gateway.runtime.launches("alpha"), 2);
}

#[tokio::test]
async fn crashed_backends_are_replaced_transparently() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#1");
    gateway.runtime.crash("alpha");

    assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#2");
    assert_eq!(gateway.runtime.launches("alpha"), 2);
}

#[tokio::test]
async fn cancelling_a_call_keeps_the_session() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = gateway.router.clone();

    let token = CancellationToken::new();
    let slow = tokio::spawn({
        let router = router.clone();
        let token = token.clone();
        async move {
            let request = Request::new(
                "slow-1",
                "tools/call",
                Some(json!({"name": "slow", "arguments": {"provider": "alpha"}})),
            );
            router.handle_request(request, token).await
        }
    });

    assert!(eventually(|| gateway.runtime.slow_calls_started() == 1).await);
    token.cancel();
    let response = slow.await.unwrap();
    assert_eq!(error_code(&response), codes::REQUEST_CANCELLED);

    assert!(eventually(|| !gateway.runtime.cancelled_requests().is_empty()).await);
    assert_eq!(first_text(&result(&router, "tools/call", whoami("alpha")).await), "alpha#1");
    assert_eq!(gateway.runtime.launches("alpha"), 1);
}

#[tokio::test]
async fn concurrent_call_completes_while_another_is_cancelled() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = gateway.router.clone();

    let token = CancellationToken::new();
    let slow = tokio::spawn({
        let router = router.clone();
        let token = token.clone();
        async move {
            let request = Request::new(
                "slow-2",
                "tools/call",
                Some(json!({"name": "slow", "arguments": {"provider": "alpha"}})),
            );
            router.handle_request(request, token).await
        }
    });
    assert!(eventually(|| gateway.runtime.slow_calls_started() == 1).await);

    let echo = tokio::spawn({
        let router = router.clone();
        async move {
            request(
                &router,
                "tools/call",
                json!({"name": "echo", "arguments": {"provider": "alpha", "text": "still here"}}),
            )
            .await
        }
    });
    token.cancel();

    let cancelled = tokio::time::timeout(Duration::from_secs(5), slow).await.unwrap().unwrap();
    assert_eq!(error_code(&cancelled), codes::REQUEST_CANCELLED);
    let echoed = tokio::time::timeout(Duration::from_secs(5), echo)
        .await
        .unwrap()
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(first_text(&echoed), "still here");

    assert!(eventually(|| gateway.runtime.cancelled_requests().len() == 1).await);
    assert_eq!(gateway.runtime.launches("alpha"), 1);
}

#[tokio::test]
async fn refresh_stops_removed_and_restarts_changed_backends() {
    let gateway = gateway(vec![descriptor("alpha"), descriptor("beta")]).await;
    let router = &gateway.router;

    result(router, "tools/call", whoami("alpha")).await;
    result(router, "tools/call", whoami("beta")).await;
    assert_eq!(router.manager().sessions_snapshot().len(), 2);

    let mut changed = descriptor("alpha");
    changed.description = Some("now with a description".to_string());
    gateway.store.replace(vec![changed]).unwrap();
    let summary = router.refresh().await.unwrap();
    assert_eq!(summary.removed, vec!["beta".to_string()]);
    assert_eq!(summary.changed, vec!["alpha".to_string()]);
    assert!(router.manager().sessions_snapshot().is_empty());
    assert_eq!(gateway.runtime.teardowns(), 2);

    let removed = request(router, "tools/call", whoami("beta")).await;
    assert_eq!(error_code(&removed), codes::ROUTING_ERROR);
    let listing = result(router, "tools/list", json!({"provider": "beta"})).await;
    assert!(listing["tools"].as_array().unwrap().is_empty());

    assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#2");
}

#[tokio::test]
async fn install_failures_surface_as_backend_start_errors() {
    let mut broken = descriptor("broken");
    broken.install_command = Some(FAILING_INSTALL.to_string());
    let gateway = gateway(vec![descriptor("alpha"), broken]).await;
    let router = &gateway.router;

    let listing = result(router, "tools/list", json!({"provider": "broken"})).await;
    assert!(listing["tools"].as_array().unwrap().is_empty());
    assert_eq!(gateway.runtime.cache_clears(), 1);
    let installs = gateway
        .runtime
        .commands()
        .into_iter()
        .filter(|(backend, command)| backend == "broken" && command == FAILING_INSTALL)
        .count();
    assert_eq!(installs, 2, "one retry after clearing the cache");

    let response = request(router, "tools/call", whoami("broken")).await;
    assert_eq!(error_code(&response), codes::BACKEND_START_ERROR);
    let data = response.error.unwrap().data.unwrap();
    assert_eq!(data["backend"], "broken");
    assert_eq!(data["phase"], "install");
    assert!(data["stderrTail"].as_str().unwrap().contains("npm ERR!"));

    let providers = result(router, "tools/call", json!({"name": "list_providers"})).await;
    assert_eq!(providers["structuredContent"]["result"], json!(["alpha", "broken"]));
    assert_eq!(first_text(&result(router, "tools/call", whoami("alpha")).await), "alpha#1");
    assert_eq!(gateway.runtime.launches("broken"), 0);
}

#[tokio::test]
async fn unresolved_required_bindings_are_configuration_errors() {
    let mut secret = descriptor("secret");
    secret.env = vec![
        anywhere_types::EnvBinding::new("API_TOKEN", "${env:MCP_ANYWHERE_TEST_NEVER_SET_7F3A}").required(),
    ];
    let gateway = gateway(vec![secret]).await;

    let response = request(&gateway.router, "tools/call", whoami("secret")).await;
    assert_eq!(error_code(&response), codes::CONFIGURATION_ERROR);
    assert!(gateway.runtime.provisioned().is_empty());
}

#[tokio::test]
async fn shutdown_stops_every_session() {
    let gateway = gateway(vec![descriptor("alpha"), descriptor("beta")]).await;
    let router = &gateway.router;
    result(router, "tools/call", whoami("alpha")).await;
    result(router, "tools/call", whoami("beta")).await;

    router.shutdown().await;
    assert!(router.manager().sessions_snapshot().is_empty());
    assert_eq!(gateway.runtime.teardowns(), 2);
}
