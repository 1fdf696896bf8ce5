#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anywhere_mcp::config::{DescriptorStore, GatewaySettings, LifecycleSettings, StaticDescriptorStore};
use anywhere_mcp::gateway::GatewayRouter;
use anywhere_mcp::logging::LogManager;
use anywhere_mcp::protocol::{Request, Response};
use anywhere_mcp::sandbox::{
    Environment, ExecOutcome, LaunchSpec, LaunchedProcess, ProcessControl, RuntimeError, SandboxRuntime,
};
use anywhere_types::{BackendDescriptor, RuntimeKind};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Install command the fake runtime always fails.
pub const FAILING_INSTALL: &str = "exit 1";

#[derive(Default)]
struct FakeState {
    launches: HashMap<String, usize>,
    commands: Vec<(String, String)>,
    provisioned: Vec<LaunchSpec>,
    cache_clears: usize,
    teardowns: usize,
    processes: HashMap<String, Vec<FakeControl>>,
}

/// A sandbox whose processes are in-process mock MCP servers.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    cancelled: Arc<Mutex<Vec<Value>>>,
    slow_started: Arc<AtomicUsize>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn launches(&self, backend_id: &str) -> usize {
        self.state().launches.get(backend_id).copied().unwrap_or(0)
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.state().commands.clone()
    }

    pub fn provisioned(&self) -> Vec<LaunchSpec> {
        self.state().provisioned.clone()
    }

    pub fn cache_clears(&self) -> usize {
        self.state().cache_clears
    }

    pub fn teardowns(&self) -> usize {
        self.state().teardowns
    }

    /// Request ids the mock servers received `notifications/cancelled` for.
    pub fn cancelled_requests(&self) -> Vec<Value> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn slow_calls_started(&self) -> usize {
        self.slow_started.load(Ordering::SeqCst)
    }

    /// Kills every process of `backend_id` as if it crashed.
    pub fn crash(&self, backend_id: &str) {
        let processes = self.state().processes.get(backend_id).cloned().unwrap_or_default();
        for mut process in processes {
            let _ = process.kill();
        }
    }
}

#[derive(Clone)]
struct FakeControl {
    alive: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl ProcessControl for FakeControl {
    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn terminate(&mut self) -> Result<(), RuntimeError> {
        self.kill()
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        self.alive.store(false, Ordering::SeqCst);
        self.kill.cancel();
        Ok(())
    }
}

impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn provision(&self, spec: &LaunchSpec) -> Result<Environment, RuntimeError> {
        self.state().provisioned.push(spec.clone());
        Ok(Environment {
            backend_id: spec.backend_id.clone(),
            runtime: spec.runtime.clone(),
            reference: format!("fake-{}", spec.backend_id),
            image: spec.image.clone(),
            env: spec.env.clone(),
            owned: true,
            ephemeral: spec.ephemeral,
        })
    }

    fn execute(&self, environment: &Environment, command: &str, stdin: Option<&str>) -> Result<ExecOutcome, RuntimeError> {
        self.state()
            .commands
            .push((environment.backend_id.clone(), command.to_string()));
        if command == FAILING_INSTALL {
            return Ok(ExecOutcome {
                exit_code: 1,
                stdout: String::new(),
                stderr: "npm ERR! 404 Not Found".to_string(),
            });
        }
        let stdout = match command {
            "python3 -" => format!("executed: {}", stdin.unwrap_or_default()),
            _ => String::new(),
        };
        Ok(ExecOutcome {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    fn clear_cache(&self, _environment: &Environment) -> Result<(), RuntimeError> {
        self.state().cache_clears += 1;
        Ok(())
    }

    fn launch(&self, environment: &Environment, _start_command: &str) -> Result<LaunchedProcess, RuntimeError> {
        let backend_id = environment.backend_id.clone();
        let control = FakeControl {
            alive: Arc::new(AtomicBool::new(true)),
            kill: CancellationToken::new(),
        };
        let generation = {
            let mut state = self.state();
            let launches = state.launches.entry(backend_id.clone()).or_default();
            *launches += 1;
            let generation = *launches;
            state.processes.entry(backend_id.clone()).or_default().push(control.clone());
            generation
        };

        let (gateway_side, backend_side) = tokio::io::duplex(64 * 1024);
        let (stderr_reader, mut stderr_writer) = tokio::io::duplex(4 * 1024);
        let handle = tokio::runtime::Handle::current();
        handle.spawn(async move {
            let _ = stderr_writer
                .write_all(format!("mock {} starting\n", generation).as_bytes())
                .await;
        });
        handle.spawn(mock_backend(
            backend_side,
            MockContext {
                backend_id,
                generation,
                kill: control.kill.clone(),
                alive: Arc::clone(&control.alive),
                cancelled: Arc::clone(&self.cancelled),
                slow_started: Arc::clone(&self.slow_started),
            },
        ));

        let (stdout, stdin) = tokio::io::split(gateway_side);
        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr_reader)),
            control: Box::new(control),
        })
    }

    fn teardown(&self, _environment: &Environment) -> Result<(), RuntimeError> {
        self.state().teardowns += 1;
        Ok(())
    }

    fn health(&self) -> Result<String, RuntimeError> {
        Ok("fake 1.0".to_string())
    }
}

struct MockContext {
    backend_id: String,
    generation: usize,
    kill: CancellationToken,
    alive: Arc<AtomicBool>,
    cancelled: Arc<Mutex<Vec<Value>>>,
    slow_started: Arc<AtomicUsize>,
}

/// Line-delimited MCP server with tools `echo`, `slow` and `whoami` and one
/// prompt, `greeting`.
async fn mock_backend(stream: DuplexStream, context: MockContext) {
    let context = Arc::new(context);
    let (read, mut write) = tokio::io::split(stream);
    let (sender, mut receiver) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if write.write_all(format!("{message}\n").as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let waiting: Arc<Mutex<HashMap<String, CancellationToken>>> = Arc::default();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            _ = context.kill.cancelled() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else {
            break;
        };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();
        match message.get("id").cloned() {
            None if method == "notifications/cancelled" => {
                let request_id = message["params"]["requestId"].clone();
                context.cancelled.lock().unwrap().push(request_id.clone());
                if let Some(token) = waiting.lock().unwrap().remove(&request_id.to_string()) {
                    token.cancel();
                }
            }
            None => {}
            Some(id) => {
                let token = CancellationToken::new();
                waiting.lock().unwrap().insert(id.to_string(), token.clone());
                let context = Arc::clone(&context);
                let sender = sender.clone();
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                tokio::spawn(async move {
                    let reply = match respond(&context, &method, &params, &token).await {
                        Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Some(Err((code, text))) => {
                            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": text}})
                        }
                        None => return,
                    };
                    let _ = sender.send(reply);
                });
            }
        }
    }
    context.alive.store(false, Ordering::SeqCst);
    writer.abort();
}

async fn respond(
    context: &MockContext,
    method: &str,
    params: &Value,
    token: &CancellationToken,
) -> Option<Result<Value, (i64, String)>> {
    let text = |text: String| json!({"content": [{"type": "text", "text": text}]});
    Some(match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}, "prompts": {}},
            "serverInfo": {"name": context.backend_id, "version": "1.0.0"}
        })),
        "tools/list" => Ok(json!({"tools": [
            {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}},
            {"name": "slow", "description": "Never finishes on its own", "inputSchema": {"type": "object"}},
            {"name": "whoami", "description": "Session identity", "inputSchema": {"type": "object"}}
        ]})),
        "prompts/list" => Ok(json!({"prompts": [{"name": "greeting"}]})),
        "prompts/get" => Ok(json!({"messages": [
            {"role": "user", "content": {"type": "text", "text": format!("hello from {}", context.backend_id)}}
        ]})),
        "tools/call" => match params["name"].as_str() {
            Some("echo") => Ok(text(params["arguments"]["text"].as_str().unwrap_or_default().to_string())),
            Some("whoami") => Ok(text(format!("{}#{}", context.backend_id, context.generation))),
            Some("slow") => {
                context.slow_started.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(text("done".to_string())),
                }
            }
            other => Err((-32602, format!("Unknown tool: {other:?}"))),
        },
        other => Err((-32601, format!("Method not found: {other}"))),
    })
}

pub fn descriptor(id: &str) -> BackendDescriptor {
    BackendDescriptor::new(id, RuntimeKind::ProcessJs, "npx -y mock-server")
}

pub fn test_settings() -> GatewaySettings {
    GatewaySettings {
        call_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(5),
        lifecycle: LifecycleSettings {
            shutdown_grace: Duration::from_millis(200),
            ..LifecycleSettings::default()
        },
        ..GatewaySettings::default()
    }
}

pub struct TestGateway {
    pub router: Arc<GatewayRouter>,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<StaticDescriptorStore>,
}

pub async fn gateway(descriptors: Vec<BackendDescriptor>) -> TestGateway {
    gateway_with(descriptors, test_settings()).await
}

pub async fn gateway_with(descriptors: Vec<BackendDescriptor>, settings: GatewaySettings) -> TestGateway {
    let runtime = FakeRuntime::new();
    let store = Arc::new(StaticDescriptorStore::new(descriptors).unwrap());
    let shared_store: Arc<dyn DescriptorStore> = store.clone();
    let shared_runtime: Arc<dyn SandboxRuntime> = runtime.clone();
    let router = GatewayRouter::build(shared_store, shared_runtime, settings, Arc::new(LogManager::new()))
        .await
        .unwrap();
    TestGateway { router, runtime, store }
}

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

pub async fn request(router: &GatewayRouter, method: &str, params: Value) -> Response {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    router
        .handle_request(Request::new(id, method, Some(params)), CancellationToken::new())
        .await
}

/// Sends a request and returns its result, panicking on an error response.
pub async fn result(router: &GatewayRouter, method: &str, params: Value) -> Value {
    let response = request(router, method, params).await;
    match response.into_result() {
        Ok(result) => result,
        Err(error) => panic!("{method} failed: {error}"),
    }
}

/// Error code of a response that must have failed.
pub fn error_code(response: &Response) -> i64 {
    response.error.as_ref().map(|error| error.code).expect("expected an error response")
}

pub fn names(result: &Value, items_key: &str) -> Vec<String> {
    result[items_key]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap().to_string())
        .collect()
}

pub fn first_text(result: &Value) -> String {
    result["content"][0]["text"].as_str().unwrap().to_string()
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
