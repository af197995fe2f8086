//! Reachability check: `GET http://host:port/_serverInfo`.
//!
//! The server answers with the usual response body (`status`, `result`, `error`), so the
//! in-band status decides success, not the HTTP status line.

use crate::config::GatewayConfig;
use crate::gateway::error::GatewayError;
use crate::gateway::protocol::Response;
use serde_json::Value;

/// Fetch server information from the server `config` points at. Returns `result` when the
/// body reports status 200.
pub async fn server_info(config: &GatewayConfig) -> Result<Value, GatewayError> {
    let url = format!("{}/_serverInfo", config.http_url());
    let res = match fetch(&url).await {
        Ok(r) => r,
        Err(e) => {
            log::error!("unable to reach server at {}: {}", url, e);
            return Err(e);
        }
    };
    match res.into_result() {
        Ok(res) => Ok(res.result.unwrap_or(Value::Null)),
        Err(e) => {
            log::error!("unable to reach server at {}", url);
            if let GatewayError::Service { message, stack, .. } = &e {
                log::error!("{}", message);
                if let Some(stack) = stack {
                    log::error!("{}", stack);
                }
            }
            Err(e)
        }
    }
}

async fn fetch(url: &str) -> Result<Response, GatewayError> {
    let text = reqwest::Client::new().get(url).send().await?.text().await?;
    Ok(serde_json::from_str(&text)?)
}
