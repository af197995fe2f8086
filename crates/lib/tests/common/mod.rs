//! In-memory transport for driving the gateway deterministically under paused time.

#![allow(dead_code)]

use async_trait::async_trait;
use kiot::config::GatewayConfig;
use kiot::gateway::{Connection, Connector, Envelope, Frame, GatewayError};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Client half handed to the gateway.
pub struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        self.outbound
            .send(frame)
            .map_err(|_| GatewayError::Send("peer gone".to_string()))
    }

    async fn receive(&mut self) -> Result<Frame, GatewayError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| GatewayError::Closed("peer gone".to_string()))
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.inbound.close();
        Ok(())
    }
}

/// Server half kept by the test. Dropping it makes the client see a closed connection.
pub struct MockServer {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

pub fn pair() -> (MockConnection, MockServer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        MockConnection { inbound, outbound },
        MockServer {
            to_client,
            from_client,
        },
    )
}

impl MockServer {
    /// Next frame written by the client; `None` once the client dropped the connection.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame decoded as a request envelope, skipping control frames.
    pub async fn next_request(&mut self) -> Option<Envelope> {
        loop {
            match self.next_frame().await? {
                Frame::Text(text) => return Some(serde_json::from_str(&text).expect("envelope")),
                Frame::Ping(_) | Frame::Pong(_) => continue,
            }
        }
    }

    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.to_client.send(frame);
    }

    pub fn send_json(&self, v: Value) {
        self.send(Frame::Text(v.to_string()));
    }

    /// Answer `req` with `status` and `result`.
    pub fn reply(&self, req: &Envelope, status: u16, result: Value) {
        self.send_json(json!({
            "requestId": req.request_id,
            "status": status,
            "controller": req.controller,
            "action": req.action,
            "index": req.index,
            "collection": req.collection,
            "result": result,
        }));
    }

    /// Read the next request and answer it.
    pub async fn answer_next(&mut self, status: u16, result: Value) -> Envelope {
        let req = self.next_request().await.expect("request");
        self.reply(&req, status, result);
        req
    }

    /// Push a real-time document notification as another client's write would produce.
    pub fn notify(&self, request_id: &str, action: &str, source: Value) {
        self.notify_to("iot", "device-state", request_id, action, source);
    }

    /// Like `notify`, for a document of `index/collection`.
    pub fn notify_to(&self, index: &str, collection: &str, request_id: &str, action: &str, source: Value) {
        self.send_json(json!({
            "requestId": request_id,
            "status": 200,
            "controller": "document",
            "action": action,
            "index": index,
            "collection": collection,
            "room": format!("room-{}-{}", index, collection),
            "result": { "_id": uuid::Uuid::new_v4().to_string(), "_source": source },
        }));
    }
}

enum Plan {
    Accept(MockConnection),
    Refuse,
}

/// Hands out queued connections in order; refuses once the queue is empty.
#[derive(Default)]
pub struct MockConnector {
    plan: Mutex<VecDeque<Plan>>,
    attempts: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a connection that will be accepted; returns its server half.
    pub fn accept(&self) -> MockServer {
        let (conn, server) = pair();
        self.plan.lock().unwrap().push_back(Plan::Accept(conn));
        server
    }

    /// Queue a refused attempt.
    pub fn refuse(&self) {
        self.plan.lock().unwrap().push_back(Plan::Refuse);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, GatewayError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let next = self.plan.lock().unwrap().pop_front();
        match next {
            Some(Plan::Accept(conn)) => Ok(Box::new(conn)),
            Some(Plan::Refuse) | None => Err(GatewayError::Connect("refused".to_string())),
        }
    }
}

/// Default timers: 60s read timeout, 10s ping acknowledgment window, 5s reconnect delay, 30s request deadline.
pub fn config() -> GatewayConfig {
    GatewayConfig::default()
}
