//! Wire protocol types: request envelopes, responses and state notifications.

use crate::gateway::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONTROLLER_DOCUMENT: &str = "document";
pub const CONTROLLER_REALTIME: &str = "realtime";

/// Status the server uses for a successful response.
pub const STATUS_OK: u16 = 200;

/// Request kinds the gateway knows how to build and correlate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    CreateOrReplace,
    Create,
    Subscribe,
    Unsubscribe,
    /// Any other controller/action pair.
    Query,
}

impl RequestKind {
    pub fn from_parts(controller: &str, action: &str) -> Self {
        match (controller, action) {
            (CONTROLLER_DOCUMENT, "get") => RequestKind::Get,
            (CONTROLLER_DOCUMENT, "createOrReplace") => RequestKind::CreateOrReplace,
            (CONTROLLER_DOCUMENT, "create") => RequestKind::Create,
            (CONTROLLER_REALTIME, "subscribe") => RequestKind::Subscribe,
            (CONTROLLER_REALTIME, "unsubscribe") => RequestKind::Unsubscribe,
            _ => RequestKind::Query,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestKind::Get => "get",
            RequestKind::CreateOrReplace => "createOrReplace",
            RequestKind::Create => "create",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Unsubscribe => "unsubscribe",
            RequestKind::Query => "query",
        };
        f.write_str(s)
    }
}

/// Wire request: `{ "index", "collection", "controller", "action", "requestId", "_id"?, "body"? }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub controller: String,
    pub action: String,
    /// Empty means "assign one at submit time".
    #[serde(default)]
    pub request_id: String,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Envelope {
    pub fn new(controller: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, index: impl Into<String>, collection: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self.collection = Some(collection.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::from_parts(&self.controller, &self.action)
    }
}

/// Typed requests. Each kind fixes its controller/action pair; the request id is assigned
/// by the correlator unless set on the resulting envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get {
        index: String,
        collection: String,
        id: String,
    },
    CreateOrReplace {
        index: String,
        collection: String,
        id: String,
        body: Value,
    },
    Create {
        index: String,
        collection: String,
        body: Value,
    },
    Subscribe {
        index: String,
        collection: String,
        filter: Value,
    },
    Unsubscribe {
        room_id: String,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Get { .. } => RequestKind::Get,
            Request::CreateOrReplace { .. } => RequestKind::CreateOrReplace,
            Request::Create { .. } => RequestKind::Create,
            Request::Subscribe { .. } => RequestKind::Subscribe,
            Request::Unsubscribe { .. } => RequestKind::Unsubscribe,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            Request::Get { index, collection, id } => Envelope::new(CONTROLLER_DOCUMENT, "get")
                .with_target(index, collection)
                .with_id(id),
            Request::CreateOrReplace {
                index,
                collection,
                id,
                body,
            } => Envelope::new(CONTROLLER_DOCUMENT, "createOrReplace")
                .with_target(index, collection)
                .with_id(id)
                .with_body(body),
            Request::Create {
                index,
                collection,
                body,
            } => Envelope::new(CONTROLLER_DOCUMENT, "create")
                .with_target(index, collection)
                .with_body(body),
            Request::Subscribe {
                index,
                collection,
                filter,
            } => Envelope::new(CONTROLLER_REALTIME, "subscribe")
                .with_target(index, collection)
                .with_body(filter),
            Request::Unsubscribe { room_id } => Envelope::new(CONTROLLER_REALTIME, "unsubscribe")
                .with_body(serde_json::json!({ "roomId": room_id })),
        }
    }
}

/// Real-time filter matching documents whose `field` equals `value`.
pub fn equals_filter(field: &str, value: &str) -> Value {
    let mut equals = serde_json::Map::new();
    equals.insert(field.to_string(), Value::String(value.to_string()));
    serde_json::json!({ "equals": equals })
}

impl From<Request> for Envelope {
    fn from(req: Request) -> Self {
        req.into_envelope()
    }
}

/// Error details attached to a non-200 response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Inbound frame: a response to a request or a real-time notification.
/// Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceErrorBody>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    /// `result._source`, the stored document.
    pub fn source(&self) -> Option<&Value> {
        self.result.as_ref()?.get("_source")
    }

    /// `result._id`, the document id.
    pub fn document_id(&self) -> Option<&str> {
        self.result.as_ref()?.get("_id")?.as_str()
    }

    /// True for a real-time notification: it names the room it was published to. Responses
    /// either carry no room or echo their own request id there.
    pub fn is_notification(&self) -> bool {
        match self.room.as_deref() {
            Some(room) => !room.is_empty() && room != self.request_id,
            None => false,
        }
    }

    /// `result.roomId` of a subscribe response.
    pub fn room_id(&self) -> Option<&str> {
        self.result.as_ref()?.get("roomId")?.as_str()
    }

    /// Turn a non-200 status into `GatewayError::Service`.
    pub fn into_result(self) -> Result<Response, GatewayError> {
        if self.is_success() {
            return Ok(self);
        }
        let (message, stack) = match self.error {
            Some(e) => (e.message, e.stack),
            None => (format!("request {} failed", self.request_id), None),
        };
        Err(GatewayError::Service {
            status: self.status,
            message,
            stack,
        })
    }
}

/// A state change delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Subject key the notification was routed by (e.g. the device id).
    pub subject: String,
    /// Document action that produced the notification ("create" or "replace").
    pub action: String,
    /// `_source.state`, or `null` when absent.
    pub state: Value,
    /// True when the publisher marked the state as partial.
    pub partial: bool,
    /// The full `_source` document.
    pub source: Value,
}

impl Notification {
    pub(crate) fn from_source(subject: String, action: String, source: &Value) -> Self {
        let partial = source
            .get("partial_state")
            .or_else(|| source.get("is_partial"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            subject,
            action,
            state: source.get("state").cloned().unwrap_or(Value::Null),
            partial,
            source: source.clone(),
        }
    }
}
