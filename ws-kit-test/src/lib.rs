//! Shared message catalog and harness for the integration suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ws_kit::transport::{socket_pair, TestClient};
use ws_kit::{events, rpcs};
use ws_kit::{
    CloseInfo, HeartbeatConfig, Issue, Router, RouterConfig, SchemaId, Validated, ValidatorAdapter,
};

//////////////////////////////////////////////////////////////////////////////
// CATALOG
//////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatBody {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteBody {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetUserReq {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountReq {
    pub to: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountState {
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomReq {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Joined {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReq {
    pub topic: String,
    pub text: String,
    #[serde(default)]
    pub exclude_self: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishAck {
    pub matched: Option<u64>,
    pub capability: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTopicsReq {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicsChanged {
    pub added: u64,
    pub removed: u64,
    pub total: u64,
}

events! {
    | EventTy     | PayloadTy | Type           |
    | -------     | --------- | ----           |
    | ChatMessage | ChatBody  | "CHAT_MESSAGE" |
    | RoomNote    | NoteBody  | "ROOM_NOTE"    |
}

rpcs! {
    | RpcTy       | RequestTy    | ResponseTy    | Type           | ResponseType     |
    | -----       | ---------    | ----------    | ----           | ------------     |
    | GetUser     | GetUserReq   | User          | "GET_USER"     | "USER"           |
    | SlowCount   | CountReq     | CountState    | "SLOW_COUNT"   | "COUNT"          |
    | JoinRoom    | JoinRoomReq  | Joined        | "JOIN_ROOM"    | "JOINED"         |
    | PublishNote | PublishReq   | PublishAck    | "PUBLISH_NOTE" | "PUBLISH_ACK"    |
    | SetTopics   | SetTopicsReq | TopicsChanged | "SET_TOPICS"   | "TOPICS_CHANGED" |
}

//////////////////////////////////////////////////////////////////////////////
// VALIDATOR
//////////////////////////////////////////////////////////////////////////////

type Rule = Arc<dyn Fn(&Value) -> Vec<Issue> + Send + Sync>;

/// A closure-table validator: one rule per schema name, unknown schemas
/// pass.
#[derive(Default, Clone)]
pub struct TableValidator {
    rules: HashMap<&'static str, Rule>,
}

impl TableValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(
        mut self,
        schema: &'static str,
        rule: impl Fn(&Value) -> Vec<Issue> + Send + Sync + 'static,
    ) -> Self {
        self.rules.insert(schema, Arc::new(rule));
        self
    }
}

impl ValidatorAdapter for TableValidator {
    fn validate(&self, schema: SchemaId, envelope: &Value) -> Validated {
        match self.rules.get(schema.as_str()) {
            Some(rule) => {
                let issues = rule(envelope);
                if issues.is_empty() {
                    Validated::Valid(None)
                } else {
                    Validated::Invalid(issues)
                }
            }
            None => Validated::Valid(None),
        }
    }
}

/// A rule requiring `payload.<field>` to be a string.
pub fn require_string_field(field: &'static str) -> impl Fn(&Value) -> Vec<Issue> + Send + Sync {
    move |envelope| match envelope.get("payload").and_then(|p| p.get(field)) {
        Some(Value::String(_)) => Vec::new(),
        _ => vec![Issue::new(
            format!("payload.{field}"),
            format!("expected a string at {field}"),
        )],
    }
}

//////////////////////////////////////////////////////////////////////////////
// HARNESS
//////////////////////////////////////////////////////////////////////////////

/// Router options for suites that drive frames by hand: heartbeats off so
/// pings never interleave with assertions.
pub fn base_config() -> RouterConfig {
    RouterConfig {
        heartbeat: HeartbeatConfig::disabled(),
        ..RouterConfig::default()
    }
}

/// Initialize tracing once for the whole test binary; `RUST_LOG` controls
/// verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Connect a fake client to the router and drive the connection in a
/// background task.
pub fn connect(router: &Arc<Router>) -> (TestClient, tokio::task::JoinHandle<CloseInfo>) {
    init_tracing();
    let (socket, rx, client) = socket_pair(64);
    let router = router.clone();
    let handle = tokio::spawn(async move { router.serve(socket, rx).await });
    (client, handle)
}

/// Collects the kinds of every `on_error` event, for assertions.
#[derive(Default, Clone)]
pub struct ErrorLog {
    kinds: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, router: &mut Router) {
        let kinds = self.kinds.clone();
        router.on_error(move |event| {
            kinds.lock().unwrap().push(event.kind().to_owned());
        });
    }

    pub fn kinds(&self) -> Vec<String> {
        self.kinds.lock().unwrap().clone()
    }

    /// Wait until a kind shows up; errors are emitted asynchronously to
    /// the client-visible stream.
    pub async fn wait_for(&self, kind: &str) {
        for _ in 0..200 {
            if self.kinds().iter().any(|k| k == kind) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("error kind {kind:?} never surfaced; saw {:?}", self.kinds());
    }
}
