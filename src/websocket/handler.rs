use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events;
use crate::auth::User;
use crate::backend::frames;
use crate::channel::Subscriber;
use crate::context::Context;
use crate::error::ErrorCode;
use crate::protocol::{self, Envelope};
use crate::vhost::Vhost;

/// How long the cleanup path waits for the forwarding task to flush its
/// close frame before aborting it.
const SEND_TASK_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Upgrade handler
// ============================================================================

/// GET /<vhost-path> — upgrade to a WebSocket connection bound to the vhost
/// named by the URL path.
///
/// The upgrade is always completed; an unknown vhost is reported in-band as
/// `__error__ VHOST_NOT_FOUND` followed by a close, so browser clients see
/// the failure through the same JSON envelope as every other error.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(path): Path<String>,
    State(context): State<Context>,
) -> Response {
    let vhost_path = format!("/{path}");
    ws.on_upgrade(move |socket| {
        let tracker = context.tracker().clone();
        tracker.track_future(handle_socket(socket, vhost_path, context))
    })
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: WebSocket, vhost_path: String, context: Context) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let vhost = match context.vhost(&vhost_path).await {
        Ok(vhost) => vhost,
        Err(_) => {
            tracing::debug!(vhost = %vhost_path, "rejecting connection to unknown vhost");
            let _ = ws_sender
                .send(Message::Text(events::error(ErrorCode::VhostNotFound)))
                .await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    // Greet before entering the protocol loop so the client always sees
    // __connected__ as the first frame.
    if ws_sender
        .send(Message::Text(events::connected()))
        .await
        .is_err()
    {
        return;
    }

    let config = context.config().clone();
    let (tx, rx) = mpsc::channel::<String>(config.queue_bound);
    let cancel = context.cancel_token().child_token();

    let mut send_task = tokio::spawn(forward_outbound(ws_sender, rx, cancel.clone()));

    let mut session = Session::new(vhost, tx, cancel.clone(), config.auth_retry_budget);
    tracing::debug!(vhost = %vhost_path, connection = %session.id, "frontend connected");

    let heartbeat_enabled = !config.heartbeat_interval.is_zero();
    let heartbeat_period = if heartbeat_enabled {
        config.heartbeat_interval
    } else {
        Duration::from_secs(3600)
    };
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_period,
        heartbeat_period,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick(), if heartbeat_enabled => {
                // A client that cannot drain heartbeats is a slow consumer.
                if session.tx.try_send(events::heartbeat()).is_err() {
                    tracing::debug!(connection = %session.id, "heartbeat overflow; closing");
                    break;
                }
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if session.handle_frame(&text).await == Flow::Close {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Axum answers Ping frames itself; binary frames are not part
                // of the protocol and are ignored.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection = %session.id, error = ?e, "receive error");
                    break;
                }
            }
        }
    }

    session.leave_all_channels().await;
    cancel.cancel();
    if tokio::time::timeout(SEND_TASK_GRACE, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
        let _ = send_task.await;
    }
    tracing::debug!(connection = %session.id, "frontend disconnected");
}

/// Forward frames from the session's outbound queue to the socket. Runs
/// until the queue closes, the transport fails, or the connection is
/// cancelled (slow-consumer drop or context shutdown).
async fn forward_outbound(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if ws_sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

// ============================================================================
// Per-connection state machine
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Frontend protocol state for one connection: UNAUTHENTICATED while `user`
/// is `None`, AUTHENTICATED once a token has been redeemed.
struct Session {
    id: Uuid,
    vhost: Arc<Vhost>,
    user: Option<User>,
    joined: HashSet<String>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    auth_failures: u32,
    auth_retry_budget: u32,
}

impl Session {
    fn new(
        vhost: Arc<Vhost>,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
        auth_retry_budget: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vhost,
            user: None,
            joined: HashSet::new(),
            tx,
            cancel,
            auth_failures: 0,
            auth_retry_budget,
        }
    }

    fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.id, self.tx.clone(), self.cancel.clone())
    }

    /// Enqueue a reply; a full queue means the client is not draining and
    /// gets the slow-consumer treatment.
    fn reply(&self, frame: String) -> Flow {
        if self.tx.try_send(frame).is_err() {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    fn reply_error(&self, code: ErrorCode) -> Flow {
        self.reply(events::error(code))
    }

    async fn handle_frame(&mut self, text: &str) -> Flow {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Framing violation: report once and drop the connection.
                let _ = self.reply_error(e.code());
                return Flow::Close;
            }
        };

        match envelope.event.as_str() {
            events::EVENT_AUTH => self.handle_auth(&envelope).await,
            events::EVENT_SUBSCRIBE => self.handle_subscribe(&envelope).await,
            events::EVENT_UNSUBSCRIBE => self.handle_unsubscribe(&envelope).await,
            events::EVENT_BROADCAST => self.handle_broadcast(&envelope).await,
            events::EVENT_TRIGGER => self.handle_trigger(&envelope).await,
            events::EVENT_CLOSE => {
                let _ = self.reply(events::closed());
                Flow::Close
            }
            other => {
                tracing::debug!(connection = %self.id, event = %other, "unknown event");
                self.reply_error(ErrorCode::InvalidPayload)
            }
        }
    }

    async fn handle_auth(&mut self, envelope: &Envelope) -> Flow {
        let token = match envelope.str_field("token") {
            Ok(token) => token,
            Err(e) => return self.reply_error(e.code()),
        };

        match self.vhost.validate_single_access_token(token).await {
            Ok(user) => {
                tracing::debug!(
                    connection = %self.id,
                    user = %user.name,
                    "frontend authenticated"
                );
                self.user = Some(user);
                self.auth_failures = 0;
                self.reply(events::authenticated())
            }
            Err(_) => {
                self.auth_failures += 1;
                let flow = self.reply_error(ErrorCode::InvalidCredentials);
                if self.auth_failures >= self.auth_retry_budget {
                    tracing::debug!(connection = %self.id, "auth retry budget exhausted");
                    return Flow::Close;
                }
                flow
            }
        }
    }

    async fn handle_subscribe(&mut self, envelope: &Envelope) -> Flow {
        let name = match envelope.str_field("channel") {
            Ok(name) => name,
            Err(e) => return self.reply_error(e.code()),
        };

        let Some(channel) = self.vhost.channel(name).await else {
            return self.reply_error(ErrorCode::InvalidChannel);
        };

        // Anonymous sessions hold no rights; subscribing requires READ.
        if !self.user.as_ref().is_some_and(|u| u.permissions.can_read()) {
            return self.reply_error(ErrorCode::AccessDenied);
        }

        channel.subscribe(self.subscriber()).await;
        self.joined.insert(name.to_owned());
        self.reply(events::subscribed(name))
    }

    async fn handle_unsubscribe(&mut self, envelope: &Envelope) -> Flow {
        let name = match envelope.str_field("channel") {
            Ok(name) => name,
            Err(e) => return self.reply_error(e.code()),
        };

        if !self.joined.remove(name) {
            return self.reply_error(ErrorCode::InvalidChannel);
        }
        // The channel may have been deleted since we joined; membership was
        // already detached in that case.
        if let Some(channel) = self.vhost.channel(name).await {
            channel.unsubscribe(self.id).await;
        }
        self.reply(events::unsubscribed(name))
    }

    async fn handle_broadcast(&mut self, envelope: &Envelope) -> Flow {
        if !self.user.as_ref().is_some_and(|u| u.permissions.can_write()) {
            return self.reply_error(ErrorCode::AccessDenied);
        }

        let (name, event) = match (envelope.str_field("channel"), envelope.str_field("event")) {
            (Ok(name), Ok(event)) => (name, event),
            (Err(e), _) | (_, Err(e)) => return self.reply_error(e.code()),
        };
        if protocol::is_reserved_event(event) {
            return self.reply_error(ErrorCode::InvalidPayload);
        }

        let Some(channel) = self.vhost.channel(name).await else {
            return self.reply_error(ErrorCode::InvalidChannel);
        };

        let frame = protocol::event_frame(event, name, envelope.field("data"));
        channel.publish(&frame).await;
        Flow::Continue
    }

    async fn handle_trigger(&mut self, envelope: &Envelope) -> Flow {
        if !self.user.as_ref().is_some_and(|u| u.permissions.can_write()) {
            return self.reply_error(ErrorCode::AccessDenied);
        }

        let event = match envelope.str_field("event") {
            Ok(event) => event,
            Err(e) => return self.reply_error(e.code()),
        };

        // Fire-and-forget: the worker decides whether to respond, and does
        // so by publishing into a channel.
        self.vhost
            .workers()
            .dispatch(frames::rpc(event, envelope.field("data")))
            .await;
        Flow::Continue
    }

    /// Detach from every joined channel; runs on every exit path.
    async fn leave_all_channels(&mut self) {
        let joined: Vec<String> = self.joined.drain().collect();
        for name in joined {
            if let Some(channel) = self.vhost.channel(&name).await {
                channel.unsubscribe(self.id).await;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
