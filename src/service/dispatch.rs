// ----------------------------------------------------------------------------
// RPC Dispatch
// ----------------------------------------------------------------------------
// Every exposed method is an enum variant mapped to one typed handler. The
// table is built once per dispatcher; unknown names never reach the service.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::StatService;
use crate::constants::REPLY_OK;
use crate::error::{StatsError, StatsResult};
use crate::event::ChargingEvent;

/// Methods of the `StatSV1` RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsMethod {
    ProcessEvent,
    GetQueueIds,
    GetStringMetrics,
    GetFloatMetrics,
    LoadQueues,
    UnloadQueues,
}

impl StatsMethod {
    pub const ALL: [StatsMethod; 6] = [
        StatsMethod::ProcessEvent,
        StatsMethod::GetQueueIds,
        StatsMethod::GetStringMetrics,
        StatsMethod::GetFloatMetrics,
        StatsMethod::LoadQueues,
        StatsMethod::UnloadQueues,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsMethod::ProcessEvent => "StatSV1.ProcessEvent",
            StatsMethod::GetQueueIds => "StatSV1.GetQueueIDs",
            StatsMethod::GetStringMetrics => "StatSV1.GetStringMetrics",
            StatsMethod::GetFloatMetrics => "StatSV1.GetFloatMetrics",
            StatsMethod::LoadQueues => "StatSV1.LoadQueues",
            StatsMethod::UnloadQueues => "StatSV1.UnloadQueues",
        }
    }
}

impl Display for StatsMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsMethod {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatsMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| StatsError::UnsupportedMethod(s.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Arguments & Wire Types
// ----------------------------------------------------------------------------

/// Arguments of `StatSV1.LoadQueues`; no IDs loads every configured queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgsLoadQueues {
    #[serde(default)]
    pub queue_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgsUnloadQueues {
    pub queue_ids: Vec<String>,
}

/// One request line.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<JsonValue>,
    pub method: String,
    #[serde(default)]
    pub params: JsonValue,
}

/// One reply line: exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub error: Option<RpcFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcFailure {
    pub category: &'static str,
    pub message: String,
}

impl From<&StatsError> for RpcFailure {
    fn from(error: &StatsError) -> Self {
        Self {
            category: error.category(),
            message: error.to_string(),
        }
    }
}

impl RpcResponse {
    fn from_result(id: Option<JsonValue>, result: StatsResult<JsonValue>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                id,
                result: None,
                error: Some(RpcFailure::from(&error)),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

type Handler = Box<dyn Fn(Arc<StatService>, JsonValue) -> BoxFuture<'static, StatsResult<JsonValue>> + Send + Sync>;

fn handler<A, R, F, Fut>(method: StatsMethod, f: F) -> Handler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(Arc<StatService>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StatsResult<R>> + Send + 'static,
{
    Box::new(move |service, params| {
        let call = serde_json::from_value::<A>(params)
            .map_err(|e| StatsError::invalid_arguments(method.as_str(), e.to_string()))
            .map(|args| f(service, args));
        async move {
            let reply = call?.await?;
            serde_json::to_value(reply).map_err(|e| StatsError::Internal(format!("encoding reply: {}", e)))
        }
        .boxed()
    })
}

/// Maps `StatSV1.*` method names onto the service.
pub struct StatsDispatcher {
    service: Arc<StatService>,
    handlers: HashMap<StatsMethod, Handler>,
}

impl StatsDispatcher {
    pub fn new(service: Arc<StatService>) -> Self {
        let mut handlers: HashMap<StatsMethod, Handler> = HashMap::new();

        handlers.insert(
            StatsMethod::ProcessEvent,
            handler(StatsMethod::ProcessEvent, |svc: Arc<StatService>, event: ChargingEvent| async move {
                svc.process_event(&event).map(|_| REPLY_OK)
            }),
        );
        handlers.insert(
            StatsMethod::GetQueueIds,
            handler(StatsMethod::GetQueueIds, |svc: Arc<StatService>, _: JsonValue| async move {
                svc.list_queue_ids()
            }),
        );
        handlers.insert(
            StatsMethod::GetStringMetrics,
            handler(StatsMethod::GetStringMetrics, |svc: Arc<StatService>, queue_id: String| async move {
                svc.get_string_metrics(&queue_id)
            }),
        );
        handlers.insert(
            StatsMethod::GetFloatMetrics,
            handler(StatsMethod::GetFloatMetrics, |svc: Arc<StatService>, queue_id: String| async move {
                svc.get_float_metrics(&queue_id)
            }),
        );
        handlers.insert(
            StatsMethod::LoadQueues,
            handler(
                StatsMethod::LoadQueues,
                |svc: Arc<StatService>, args: Option<ArgsLoadQueues>| async move {
                    svc.load_queues(args.unwrap_or_default().queue_ids).await
                },
            ),
        );
        handlers.insert(
            StatsMethod::UnloadQueues,
            handler(StatsMethod::UnloadQueues, |svc: Arc<StatService>, args: ArgsUnloadQueues| async move {
                svc.unload_queues(&args.queue_ids).await
            }),
        );

        Self { service, handlers }
    }

    pub fn service(&self) -> &Arc<StatService> {
        &self.service
    }

    /// Methods served, in a stable order.
    pub fn methods(&self) -> Vec<StatsMethod> {
        StatsMethod::ALL
            .into_iter()
            .filter(|m| self.handlers.contains_key(m))
            .collect()
    }

    /// Invoke a method by name with JSON parameters.
    pub async fn call(&self, method: &str, params: JsonValue) -> StatsResult<JsonValue> {
        let method: StatsMethod = method.parse()?;
        let handler = self
            .handlers
            .get(&method)
            .ok_or_else(|| StatsError::UnsupportedMethod(method.to_string()))?;
        handler(self.service.clone(), params).await
    }

    /// Serve one JSON request line and render the reply line.
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => {
                let result = self.call(&request.method, request.params).await;
                match &result {
                    Ok(_) => debug!(target: "statq::rpc", method = %request.method, "Request served"),
                    Err(e) => debug!(
                        target: "statq::rpc",
                        method = %request.method,
                        error = %e,
                        category = e.category(),
                        "Request failed"
                    ),
                }
                RpcResponse::from_result(request.id, result)
            }
            Err(e) => {
                warn!(target: "statq::rpc", error = %e, "Malformed request");
                RpcResponse::from_result(None, Err(StatsError::invalid_arguments("request", e.to_string())))
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                r#"{{"id":null,"result":null,"error":{{"category":"internal","message":"{}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}

impl fmt::Debug for StatsDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsDispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}
