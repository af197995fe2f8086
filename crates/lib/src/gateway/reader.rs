//! Reader loop: the only task that touches the connection.
//!
//! It reads and writes: caller frames arrive through an unbounded queue and are written
//! here, so there is exactly one reader and one writer on the socket. Inbound frames are
//! decoded and routed to the correlator or the subscription router. Silence is handed to
//! the heartbeat monitor, loss to the reconnection controller.

use crate::gateway::client::{ConnectionState, Shared};
use crate::gateway::connection::{Connection, Connector, Frame};
use crate::gateway::correlator::{new_request_id, Resolution};
use crate::gateway::error::GatewayError;
use crate::gateway::heartbeat::{Heartbeat, HeartbeatAction};
use crate::gateway::protocol::{equals_filter, Request, RequestKind, Response};
use crate::gateway::reconnect::{self, shutdown_requested, wait_shutdown};
use crate::gateway::router::{Dispatch, Topic};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

enum Exit {
    /// Caller asked to disconnect, or every gateway handle is gone.
    Shutdown,
    /// The connection died; recoverable.
    Lost(GatewayError),
}

/// Where an inbound frame ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Reply,
    Notification(Dispatch),
    /// Response or echo of this gateway's own state publications.
    OwnPublication,
    /// Answer to a request whose caller stopped waiting.
    Late,
    Dropped,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    mut conn: Box<dyn Connection>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut exit = drive(&shared, conn.as_mut(), &mut outbound, &mut shutdown).await;
    loop {
        match exit {
            Exit::Shutdown => {
                shared.set_state(ConnectionState::Disconnecting);
                flush(conn.as_mut(), &mut outbound).await;
                if let Err(e) = conn.close().await {
                    log::debug!("close on disconnect: {}", e);
                }
                break;
            }
            Exit::Lost(reason) => {
                log::warn!("connection lost: {}", reason);
                let _ = conn.close().await;
                shared.set_state(ConnectionState::Reconnecting);
                let delay = shared.config.reconnect_delay();
                match reconnect::reconnect(connector.as_ref(), delay, &mut shutdown).await {
                    Some(c) => conn = c,
                    None => {
                        shared.set_state(ConnectionState::Disconnecting);
                        break;
                    }
                }
                shared.set_state(ConnectionState::Connected);
                shared.router.forget_rooms();
                if shared.config.resubscribe_on_reconnect {
                    if let Err(e) = resubscribe(&shared, conn.as_mut()).await {
                        exit = Exit::Lost(e);
                        continue;
                    }
                }
                exit = drive(&shared, conn.as_mut(), &mut outbound, &mut shutdown).await;
            }
        }
    }

    shared.correlator.fail_all();
    shared.router.clear();
    shared.set_state(ConnectionState::Disconnected);
    log::info!("reader loop stopped");
}

/// Serve one connection until it is lost or shutdown is requested.
async fn drive(
    shared: &Shared,
    conn: &mut dyn Connection,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let mut heartbeat = Heartbeat::new(shared.config.read_timeout(), shared.config.ping_timeout());
    loop {
        if shutdown_requested(shutdown) {
            return Exit::Shutdown;
        }
        tokio::select! {
            biased;

            _ = wait_shutdown(shutdown) => return Exit::Shutdown,
            frame = outbound.recv() => {
                let Some(frame) = frame else { return Exit::Shutdown };
                if let Err(e) = conn.send(frame).await {
                    return Exit::Lost(e);
                }
            }
            res = conn.receive_timeout(heartbeat.remaining()) => match res {
                Ok(frame) => {
                    heartbeat.on_activity();
                    if let Err(e) = handle_frame(shared, conn, frame).await {
                        return Exit::Lost(e);
                    }
                }
                Err(GatewayError::Timeout) => match heartbeat.on_timeout() {
                    HeartbeatAction::Ping(payload) => {
                        log::info!("no data for {:?}, sending heartbeat ping", shared.config.read_timeout());
                        if let Err(e) = conn.send(Frame::Ping(payload)).await {
                            return Exit::Lost(e);
                        }
                    }
                    HeartbeatAction::Dead => {
                        log::error!("no heartbeat acknowledgment within {:?}", shared.config.ping_timeout());
                        return Exit::Lost(GatewayError::Timeout);
                    }
                },
                Err(e) => return Exit::Lost(e),
            }
        }
    }
}

/// Write frames that callers queued before the disconnect.
async fn flush(conn: &mut dyn Connection, outbound: &mut mpsc::UnboundedReceiver<Frame>) {
    while let Ok(frame) = outbound.try_recv() {
        if let Err(e) = conn.send(frame).await {
            log::debug!("dropping queued frames on disconnect: {}", e);
            return;
        }
    }
}

async fn handle_frame(shared: &Shared, conn: &mut dyn Connection, frame: Frame) -> Result<(), GatewayError> {
    let text = match frame {
        Frame::Text(text) => text,
        Frame::Ping(_) | Frame::Pong(_) => return Ok(()),
    };
    let response: Response = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("dropping undecodable frame: {}", e);
            return Ok(());
        }
    };
    let route = route(shared, response);
    log::trace!("frame routed: {:?}", route);
    if let Route::Notification(dispatch) = route {
        release(shared, conn, dispatch.released).await?;
    }
    Ok(())
}

/// Classify a decoded frame and hand it to the correlator or the router. A frame naming a
/// room is a notification even when its request id is one of ours; any other frame is
/// offered to the correlator first.
pub(crate) fn route(shared: &Shared, response: Response) -> Route {
    if !response.request_id.is_empty() && response.request_id == shared.publish_request_id {
        if !response.is_success() {
            log::warn!(
                "state publication failed with status {}: {}",
                response.status,
                response.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
            );
        }
        return Route::OwnPublication;
    }

    if response.is_notification() {
        if shared.router.subject_of(&response).is_some() {
            return Route::Notification(shared.router.dispatch(&response));
        }
        log::debug!("dropping notification from room {:?}", response.room);
        return Route::Dropped;
    }

    let response = match shared.correlator.complete(response) {
        Resolution::Resolved => return Route::Reply,
        Resolution::Expired => {
            log::debug!("dropping late response to an abandoned request");
            return Route::Late;
        }
        Resolution::Unmatched(unmatched) => unmatched,
    };

    if shared.router.subject_of(&response).is_some() {
        return Route::Notification(shared.router.dispatch(&response));
    }

    if response.is_success() {
        log::debug!("dropping unmatched frame (requestId {:?})", response.request_id);
    } else {
        log::warn!(
            "unmatched response {:?} with status {}",
            response.request_id,
            response.status
        );
    }
    Route::Dropped
}

/// Give the server back the rooms of topics nobody here watches anymore.
async fn release(shared: &Shared, conn: &mut dyn Connection, topics: Vec<Topic>) -> Result<(), GatewayError> {
    for topic in topics {
        log::info!("releasing {}: every subscriber went away", topic.subject);
        let Some(room_id) = topic.room_id else { continue };
        let request_id = new_request_id();
        let envelope = Request::Unsubscribe { room_id }
            .into_envelope()
            .with_request_id(request_id.clone());
        let registered = serde_json::to_string(&envelope)
            .map_err(GatewayError::from)
            .and_then(|text| {
                shared.correlator.register_detached(&request_id, RequestKind::Unsubscribe)?;
                Ok(text)
            });
        let text = match registered {
            Ok(text) => text,
            Err(e) => {
                log::warn!("cannot release {}: {}", topic.subject, e);
                continue;
            }
        };
        if let Err(e) = conn.send(Frame::Text(text)).await {
            shared.correlator.cancel(&request_id);
            return Err(e);
        }
    }
    Ok(())
}

/// Replay the server-side subscription of every standing subject on a fresh connection.
/// Responses are awaited in the background and update each subject's room.
async fn resubscribe(shared: &Arc<Shared>, conn: &mut dyn Connection) -> Result<(), GatewayError> {
    let topics = shared.router.standing_topics();
    if topics.is_empty() {
        return Ok(());
    }
    log::info!("re-subscribing {} subject(s)", topics.len());
    for topic in topics {
        let request_id = new_request_id();
        let envelope = Request::Subscribe {
            index: topic.index.clone(),
            collection: topic.collection.clone(),
            filter: equals_filter(&shared.config.subject_field, &topic.subject),
        }
        .into_envelope()
        .with_request_id(request_id.clone());
        let text = serde_json::to_string(&envelope)?;
        let rx = shared.correlator.register(&request_id, RequestKind::Subscribe)?;
        if let Err(e) = conn.send(Frame::Text(text)).await {
            shared.correlator.cancel(&request_id);
            return Err(e);
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            let deadline = shared.config.request_timeout();
            match shared.correlator.wait(&request_id, rx, deadline).await.and_then(Response::into_result) {
                Ok(res) => {
                    let room = res.room_id().map(str::to_string);
                    log::info!("re-subscribed to {} (room {:?})", topic.subject, room);
                    shared.router.set_room(&topic.key(), room);
                }
                Err(e) => log::warn!("re-subscribe to {} failed: {}", topic.subject, e),
            }
        });
    }
    Ok(())
}
