mod common;

use anywhere_mcp::protocol::codes;
use common::{descriptor, error_code, first_text, gateway, names, request, result};
use serde_json::json;

#[tokio::test]
async fn discovery_then_call_end_to_end() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    let tools = result(router, "tools/list", json!({})).await;
    assert_eq!(names(&tools, "tools"), vec!["list_providers", "python_sandbox"]);

    let providers = result(router, "tools/call", json!({"name": "list_providers", "arguments": {}})).await;
    assert_eq!(providers["structuredContent"]["result"], json!(["alpha"]));

    let tools = result(router, "tools/list", json!({"provider": "alpha"})).await;
    assert_eq!(names(&tools, "tools"), vec!["echo", "slow", "whoami"]);

    let echoed = result(
        router,
        "tools/call",
        json!({"name": "echo", "arguments": {"provider": "alpha", "text": "hi"}}),
    )
    .await;
    assert_eq!(first_text(&echoed), "hi");
}

#[tokio::test]
async fn backend_tools_stay_hidden_without_a_provider() {
    let gateway = gateway(vec![descriptor("alpha"), descriptor("beta")]).await;
    let router = &gateway.router;

    let tools = result(router, "tools/list", json!({})).await;
    assert!(names(&tools, "tools").iter().all(|name| !name.contains("echo")));
    assert_eq!(gateway.runtime.launches("alpha"), 0, "listing local tools must not start backends");

    let prompts = result(router, "prompts/list", json!({})).await;
    assert!(prompts["prompts"].as_array().unwrap().is_empty());

    let unknown = result(router, "tools/list", json!({"provider": "nonexistent"})).await;
    assert!(unknown["tools"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn prefixed_and_provider_forms_reach_the_same_tool() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    let prefixed = result(router, "tools/call", json!({"name": "alpha_echo", "arguments": {"text": "one"}})).await;
    assert_eq!(first_text(&prefixed), "one");

    let top_level = result(
        router,
        "tools/call",
        json!({"name": "echo", "provider": "alpha", "arguments": {"text": "two"}}),
    )
    .await;
    assert_eq!(first_text(&top_level), "two");

    let already_prefixed = result(
        router,
        "tools/call",
        json!({"name": "alpha_echo", "arguments": {"provider": "alpha", "text": "three"}}),
    )
    .await;
    assert_eq!(first_text(&already_prefixed), "three");
}

#[tokio::test]
async fn unknown_targets_are_routing_errors() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    let unknown_provider = request(
        router,
        "tools/call",
        json!({"name": "echo", "arguments": {"provider": "nonexistent"}}),
    )
    .await;
    assert_eq!(error_code(&unknown_provider), codes::ROUTING_ERROR);
    let data = unknown_provider.error.unwrap().data.unwrap();
    assert_eq!(data["kind"], "routing");

    let bare = request(router, "tools/call", json!({"name": "echo", "arguments": {}})).await;
    assert_eq!(error_code(&bare), codes::ROUTING_ERROR);

    let missing_name = request(router, "tools/call", json!({"arguments": {}})).await;
    assert_eq!(error_code(&missing_name), codes::INVALID_PARAMS);

    let unknown_method = request(router, "sampling/createMessage", json!({})).await;
    assert_eq!(error_code(&unknown_method), codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn disabled_tools_are_hidden_and_refused() {
    let mut alpha = descriptor("alpha");
    alpha.disabled_tools = vec!["slow".to_string()];
    let gateway = gateway(vec![alpha]).await;
    let router = &gateway.router;

    let tools = result(router, "tools/list", json!({"provider": "alpha"})).await;
    assert_eq!(names(&tools, "tools"), vec!["echo", "whoami"]);

    for params in [
        json!({"name": "slow", "arguments": {"provider": "alpha"}}),
        json!({"name": "alpha_slow", "arguments": {}}),
    ] {
        let refused = request(router, "tools/call", params).await;
        assert_eq!(error_code(&refused), codes::ROUTING_ERROR);
    }
    assert_eq!(gateway.runtime.slow_calls_started(), 0);

    let echoed = result(
        router,
        "tools/call",
        json!({"name": "echo", "arguments": {"provider": "alpha", "text": "allowed"}}),
    )
    .await;
    assert_eq!(first_text(&echoed), "allowed");
}

#[tokio::test]
async fn backend_errors_pass_through_unchanged() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let response = request(
        &gateway.router,
        "tools/call",
        json!({"name": "missing", "arguments": {"provider": "alpha"}}),
    )
    .await;
    let error = response.error.unwrap();
    assert_eq!(error.code, -32602);
    assert!(error.message.contains("Unknown tool"));
}

#[tokio::test]
async fn prompts_follow_the_same_namespacing() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    let prompts = result(router, "prompts/list", json!({"provider": "alpha"})).await;
    assert_eq!(names(&prompts, "prompts"), vec!["greeting"]);

    let prompt = result(router, "prompts/get", json!({"name": "greeting", "provider": "alpha"})).await;
    assert_eq!(prompt["messages"][0]["content"]["text"], "hello from alpha");
}

#[tokio::test]
async fn initialize_and_ping_are_answered_locally() {
    let gateway = gateway(vec![descriptor("alpha")]).await;
    let router = &gateway.router;

    let initialized = result(router, "initialize", json!({"protocolVersion": "2025-03-26", "capabilities": {}})).await;
    assert_eq!(initialized["protocolVersion"], "2025-03-26");
    assert_eq!(initialized["serverInfo"]["name"], "mcp-anywhere");
    assert!(initialized["instructions"].as_str().unwrap().contains("provider"));

    assert_eq!(result(router, "ping", json!({})).await, json!({}));
    assert_eq!(gateway.runtime.launches("alpha"), 0);
}

#[tokio::test]
async fn python_sandbox_runs_in_a_throwaway_environment() {
    let gateway = gateway(vec![]).await;
    let outcome = result(
        &gateway.router,
        "tools/call",
        json!({
            "name": "python_sandbox",
            "arguments": {"code": "print('hi')", "libraries": ["numpy", "requests"]}
        }),
    )
    .await;

    assert_eq!(outcome["isError"], false);
    assert_eq!(outcome["structuredContent"]["status"], "success");
    assert_eq!(outcome["structuredContent"]["stdout"], "executed: print('hi')");

    let commands: Vec<String> = gateway.runtime.commands().into_iter().map(|(_, command)| command).collect();
    assert_eq!(commands, vec!["pip install --no-cache-dir 'requests'", "python3 -"]);

    let provisioned = gateway.runtime.provisioned();
    assert_eq!(provisioned.len(), 1);
    assert!(provisioned[0].ephemeral);
    assert_eq!(provisioned[0].image.as_deref(), Some("mcp-router-python-sandbox"));
    assert!(common::eventually(|| gateway.runtime.teardowns() == 1).await);
}

#[tokio::test]
async fn python_sandbox_rejects_missing_code() {
    let gateway = gateway(vec![]).await;
    let response = request(
        &gateway.router,
        "tools/call",
        json!({"name": "python_sandbox", "arguments": {"libraries": []}}),
    )
    .await;
    assert_eq!(error_code(&response), codes::INVALID_PARAMS);
    assert!(gateway.runtime.provisioned().is_empty());
}
