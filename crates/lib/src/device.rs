//! Device facade over the gateway: registration, info lookup, state publish and watch.
//!
//! Device records live in `iot/device-info` keyed by the device uid; state changes are
//! appended to `iot/device-state` and carry the uid in `device_id`.

use crate::gateway::{Gateway, GatewayError, Notification, Request, Response, Subscription};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

pub const INDEX_IOT: &str = "iot";
pub const COLLECTION_DEVICE_STATES: &str = "device-state";
pub const COLLECTION_DEVICE_INFO: &str = "device-info";

/// Descriptive fields of a device record. Unset fields are left out of the stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_loc: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_loc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<Value>,
}

/// A device known to the server by its unique id.
#[derive(Clone)]
pub struct Device {
    uid: String,
    device_type: String,
    owner: Option<String>,
    gateway: Gateway,
    retry: RetryPolicy,
}

impl Device {
    pub fn new(uid: impl Into<String>, device_type: impl Into<String>, gateway: Gateway) -> Self {
        Self {
            uid: uid.into(),
            device_type: device_type.into(),
            owner: None,
            gateway,
            retry: RetryPolicy::default(),
        }
    }

    /// Owner id (kuid) stored with the device record.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Create or replace the device record. Idempotent: the record id is the device uid, so
    /// retried attempts overwrite the same document.
    pub async fn register(&self, info: Option<&DeviceInfo>) -> Result<Response, GatewayError> {
        let body = registration_body(&self.uid, &self.device_type, self.owner.as_deref(), info)?;
        log::info!("registering device {}", self.uid);
        self.retry
            .run(|attempt| {
                let request = Request::CreateOrReplace {
                    index: INDEX_IOT.to_string(),
                    collection: COLLECTION_DEVICE_INFO.to_string(),
                    id: self.uid.clone(),
                    body: body.clone(),
                };
                async move {
                    if attempt > 1 {
                        log::debug!("register {}: attempt {}", self.uid, attempt);
                    }
                    self.gateway.request(request.into()).await
                }
            })
            .await
    }

    /// Fetch the device record. `None` when the server has no record (any non-200 status).
    pub async fn get_info(&self) -> Result<Option<DeviceInfo>, GatewayError> {
        let res = self
            .gateway
            .get(INDEX_IOT, COLLECTION_DEVICE_INFO, &self.uid)
            .await?;
        if !res.is_success() {
            log::debug!("no device info for {} (status {})", self.uid, res.status);
            return Ok(None);
        }
        match res.source() {
            Some(source) => Ok(Some(serde_json::from_value(source.clone())?)),
            None => Ok(None),
        }
    }

    /// Register the device unless a record already exists. Returns true when it registered.
    pub async fn ensure_registered(&self, info: Option<&DeviceInfo>) -> Result<bool, GatewayError> {
        if self.get_info().await?.is_some() {
            return Ok(false);
        }
        self.register(info).await?;
        Ok(true)
    }

    /// Append a state change. Fire-and-forget; this gateway does not receive its own echo.
    pub async fn publish_state(&self, state: Value, partial: bool) -> Result<(), GatewayError> {
        log::debug!("publishing state of {}", self.uid);
        let body = serde_json::json!({
            "device_id": self.uid,
            "device_type": self.device_type,
            "partial_state": partial,
            "state": state,
        });
        let request = Request::Create {
            index: INDEX_IOT.to_string(),
            collection: COLLECTION_DEVICE_STATES.to_string(),
            body,
        };
        self.gateway.publish(request.into()).await
    }

    /// Watch state changes of this device published by other clients.
    pub async fn subscribe_state(&self) -> Result<Subscription, GatewayError> {
        log::debug!("subscribing to state of {}", self.uid);
        self.gateway
            .subscribe(INDEX_IOT, COLLECTION_DEVICE_STATES, &self.uid)
            .await
    }

    /// Subscribe and invoke `callback` for each state change until the subscription ends.
    pub async fn on_state_changed<F>(&self, mut callback: F) -> Result<JoinHandle<()>, GatewayError>
    where
        F: FnMut(Notification) + Send + 'static,
    {
        let mut sub = self.subscribe_state().await?;
        Ok(tokio::spawn(async move {
            while let Some(n) = sub.next().await {
                callback(n);
            }
        }))
    }
}

/// Record body for `iot/device-info`: identity fields plus the set fields of `info`.
/// The device's own owner takes precedence over `info.owner`.
pub fn registration_body(
    uid: &str,
    device_type: &str,
    owner: Option<&str>,
    info: Option<&DeviceInfo>,
) -> Result<Value, GatewayError> {
    let mut body = Map::new();
    body.insert("device_id".to_string(), Value::String(uid.to_string()));
    body.insert(
        "owner".to_string(),
        owner.map_or(Value::Null, |o| Value::String(o.to_string())),
    );
    body.insert("device_type".to_string(), Value::String(device_type.to_string()));
    if let Some(info) = info {
        if let Value::Object(fields) = serde_json::to_value(info)? {
            for (k, v) in fields {
                if k == "owner" && owner.is_some() {
                    continue;
                }
                body.insert(k, v);
            }
        }
    }
    Ok(Value::Object(body))
}
