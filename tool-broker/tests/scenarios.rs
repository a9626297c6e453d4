//! End-to-end flows over real sockets: apps register through `AppClient`,
//! an agent speaks JSON-RPC over the agent listener.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tool_broker::kernel::{Broker, BrokerSettings};
use tool_broker::primitives::{AppName, ToolDefinition};
use tool_broker::tools::{AppClient, Parameters, ToolError, ToolExecutor};
use tool_broker::transport::{LineReceiver, LineSender, TcpTransport, Transport};

struct Harness {
    broker: Broker,
    app_addr: String,
    agent_addr: String,
    agent: Agent,
    _stop: watch::Sender<bool>,
}

struct Agent {
    sender: LineSender,
    receiver: LineReceiver,
    next_id: u64,
}

impl Agent {
    async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.sender
            .send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await
            .unwrap();
        loop {
            let response: Value = self.receiver.recv().await.unwrap().unwrap();
            if response["id"] == json!(id) {
                return response;
            }
        }
    }

    async fn call(&mut self, tool: &str, arguments: Value) -> Value {
        let response = self
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await;
        response["result"].clone()
    }

    async fn tool_names(&mut self) -> Vec<String> {
        let response = self.request("tools/list", json!({})).await;
        response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap().to_owned())
            .collect()
    }
}

async fn start(call_timeout: Duration) -> Harness {
    let broker = Broker::new(BrokerSettings::default().with_call_timeout(call_timeout));
    let (stop, stopped) = watch::channel(false);

    let apps = broker.bind_apps("127.0.0.1:0").await.unwrap();
    let app_addr = apps.local_addr().unwrap().to_string();
    let agents = broker.bind_agents("127.0.0.1:0").await.unwrap();
    let agent_addr = agents.local_addr().unwrap().to_string();

    for (listener, agents_side) in [(apps, false), (agents, true)] {
        let broker = broker.clone();
        let mut stopped = stopped.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.changed().await;
            };
            if agents_side {
                broker.serve_agents(listener, shutdown).await;
            } else {
                broker.serve_apps(listener, shutdown).await;
            }
        });
    }

    let (sender, receiver) = TcpTransport::default().connect(&agent_addr).await.unwrap();
    Harness {
        broker,
        app_addr,
        agent_addr,
        agent: Agent {
            sender,
            receiver,
            next_id: 0,
        },
        _stop: stop,
    }
}

/// Connects an app and serves it in the background; returns its sender so
/// the test can drop the connection.
async fn connect_app(harness: &Harness, executor: ToolExecutor) -> LineSender {
    let expected: Vec<_> = executor
        .definitions()
        .iter()
        .map(|tool| tool.name().to_owned())
        .collect();

    let client = AppClient::new(harness.app_addr.clone(), Arc::new(executor));
    let session = client.connect().await.unwrap();
    let sink = session.sink().clone();
    tokio::spawn(session.serve());

    for _ in 0..400 {
        let listed: Vec<_> = harness
            .broker
            .list_tools()
            .iter()
            .map(|tool| tool.name().to_owned())
            .collect();
        if expected.iter().all(|name| listed.contains(name)) {
            return sink;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("app tools never appeared: {expected:?}");
}

fn calc() -> ToolExecutor {
    let executor = ToolExecutor::new(AppName::new("Calc").unwrap());
    executor
        .register_tool(
            ToolDefinition::new("Add", "Adds a and b"),
            |parameters: Parameters| async move {
                let a = parameters.get("a").and_then(Value::as_i64);
                let b = parameters.get("b").and_then(Value::as_i64);
                match (a, b) {
                    (Some(a), Some(b)) => Ok(json!(a + b)),
                    _ => Err(ToolError::execution("`a` and `b` must be integers")),
                }
            },
        )
        .unwrap();
    executor
}

fn sleeper(app: &str, delay: Duration) -> ToolExecutor {
    let executor = ToolExecutor::new(AppName::new(app).unwrap());
    executor
        .register_tool(
            ToolDefinition::new("Sleep", "Sleeps, then answers"),
            move |_parameters: Parameters| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, ToolError>(json!("done"))
            },
        )
        .unwrap();
    executor
}

fn pinger(app: &'static str) -> ToolExecutor {
    let executor = ToolExecutor::new(AppName::new(app).unwrap());
    executor
        .register_tool(
            ToolDefinition::new("Ping", "Answers with the app's name"),
            move |_parameters: Parameters| async move { Ok::<_, ToolError>(json!(app)) },
        )
        .unwrap();
    executor
}

#[tokio::test]
async fn registered_tool_is_listed_and_callable() {
    let mut harness = start(Duration::from_secs(30)).await;
    let _calc = connect_app(&harness, calc()).await;

    assert!(harness.agent.tool_names().await.contains(&"Calc:Add".to_owned()));

    let result = harness.agent.call("Calc:Add", json!({"a": 2, "b": 3})).await;
    assert_eq!(result["isError"], json!(false));
    assert_eq!(result["payload"], json!(5));
    assert_eq!(result["content"][0]["text"], json!("5"));
}

#[tokio::test]
async fn tool_errors_come_back_as_call_content() {
    let mut harness = start(Duration::from_secs(30)).await;
    let _calc = connect_app(&harness, calc()).await;

    let response = harness
        .agent
        .request("tools/call", json!({"name": "Calc:Add", "arguments": {"a": "x"}}))
        .await;
    assert!(response.get("error").is_none());
    let result = &response["result"];
    assert_eq!(result["isError"], json!(true));
    assert_eq!(result["error"]["kind"], json!("executionError"));
    assert_eq!(
        result["error"]["message"],
        json!("execution error: `a` and `b` must be integers")
    );
}

#[tokio::test]
async fn unknown_tool_fails_without_waiting() {
    let mut harness = start(Duration::from_secs(30)).await;

    let started = Instant::now();
    let result = harness.agent.call("Ghost:Noop", json!({})).await;
    assert_eq!(result["isError"], json!(true));
    assert_eq!(result["error"]["kind"], json!("toolNotFound"));
    assert_eq!(result["error"]["message"], json!("tool not found: Ghost:Noop"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn slow_tool_times_out() {
    let mut harness = start(Duration::from_millis(300)).await;
    let _slow = connect_app(&harness, sleeper("Slow", Duration::from_secs(2))).await;

    let started = Instant::now();
    let result = harness.agent.call("Slow:Sleep", json!({})).await;
    let elapsed = started.elapsed();

    assert_eq!(result["error"]["kind"], json!("timeout"));
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(harness.broker.correlator().pending_count(), 0);
}

#[tokio::test]
async fn same_local_name_is_namespaced_per_app() {
    let mut harness = start(Duration::from_secs(30)).await;
    let _a = connect_app(&harness, pinger("A")).await;
    let _b = connect_app(&harness, pinger("B")).await;

    let names = harness.agent.tool_names().await;
    assert!(names.contains(&"A:Ping".to_owned()));
    assert!(names.contains(&"B:Ping".to_owned()));

    assert_eq!(harness.agent.call("A:Ping", json!({})).await["payload"], json!("A"));
    assert_eq!(harness.agent.call("B:Ping", json!({})).await["payload"], json!("B"));
}

#[tokio::test]
async fn disconnect_mid_call_fails_fast() {
    let mut harness = start(Duration::from_secs(30)).await;
    let app = connect_app(&harness, sleeper("Flaky", Duration::from_secs(20))).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        app.disconnect().await;
    });

    let started = Instant::now();
    let result = harness.agent.call("Flaky:Sleep", json!({})).await;
    assert_eq!(result["error"]["kind"], json!("appDisconnected"));
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(!harness.agent.tool_names().await.contains(&"Flaky:Sleep".to_owned()));
}

#[tokio::test]
async fn concurrent_calls_are_not_serialized() {
    let harness = start(Duration::from_secs(30)).await;
    let _slow = connect_app(&harness, sleeper("Slow", Duration::from_millis(300))).await;

    let started = Instant::now();
    let calls: Vec<_> = (0..8)
        .map(|_| {
            let broker = harness.broker.clone();
            tokio::spawn(async move {
                broker
                    .call_tool(tool_broker::primitives::ToolInvocation::new(
                        "Slow:Sleep",
                        Parameters::new(),
                    ))
                    .await
            })
        })
        .collect();
    for call in calls {
        assert!(call.await.unwrap().is_success());
    }
    assert!(started.elapsed() < Duration::from_millis(8 * 300));
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_open() {
    let mut harness = start(Duration::from_secs(30)).await;

    harness.agent.sender.send(&json!("not a request")).await.unwrap();
    let response: Value = harness.agent.receiver.recv().await.unwrap().unwrap();
    assert_eq!(response["error"]["code"], json!(-32600));

    let response = harness.agent.request("resources/list", json!({})).await;
    assert_eq!(response["error"]["code"], json!(-32601));

    let response = harness.agent.request("tools/call", json!({"arguments": {}})).await;
    assert_eq!(response["error"]["code"], json!(-32602));

    let response = harness.agent.request("ping", Value::Null).await;
    assert_eq!(response["result"], json!({}));
}

#[tokio::test]
async fn unparsable_line_gets_parse_error_and_connection_survives() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let harness = start(Duration::from_secs(30)).await;
    let stream = tokio::net::TcpStream::connect(&harness.agent_addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"{not json\n").await.unwrap();
    let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(response["error"]["code"], json!(-32700));
    assert_eq!(response["id"], Value::Null);

    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n")
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(response["id"], json!(7));
    assert_eq!(response["result"], json!({}));
}

#[tokio::test]
async fn initialize_and_apps_list() {
    let mut harness = start(Duration::from_secs(30)).await;
    harness.broker.add_known_app(AppName::new("Files").unwrap(), None);
    let _calc = connect_app(&harness, calc()).await;

    let response = harness.agent.request("initialize", json!({})).await;
    assert_eq!(response["result"]["serverInfo"]["name"], json!("tool-broker"));

    let response = harness.agent.request("apps/list", json!({})).await;
    let apps = response["result"]["apps"].as_array().unwrap();
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0]["name"], json!("Calc"));
    assert_eq!(apps[0]["connected"], json!(true));
    assert_eq!(apps[1]["name"], json!("Files"));
    assert_eq!(apps[1]["connected"], json!(false));
}
