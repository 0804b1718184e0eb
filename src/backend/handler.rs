use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use uuid::Uuid;

use super::frames;
use crate::auth::Permissions;
use crate::context::Context;
use crate::error::{BrokerError, BrokerResult, ErrorCode};
use crate::protocol::{self, Envelope};
use crate::vhost::Vhost;
use crate::worker::WorkerHandle;

/// Upper bound on one newline-delimited frame.
const MAX_FRAME_LEN: usize = 1 << 20;

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Drive one worker connection: IDENTIFY under the auth deadline, then the
/// READY/BUSY protocol loop until disconnect or shutdown.
///
/// Generic over the stream so the same loop serves plaintext and TLS
/// connections.
pub(crate) async fn handle_connection<S>(stream: S, peer: SocketAddr, context: Context)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let root_cancel = context.cancel_token();

    // UNAUTHENTICATED: only IDENTIFY is accepted, and only within the
    // deadline.
    let first = tokio::select! {
        _ = root_cancel.cancelled() => return,
        read = tokio::time::timeout(context.config().auth_deadline, framed.next()) => read,
    };
    let line = match first {
        Err(_) => {
            tracing::debug!(%peer, "worker did not identify within deadline");
            let _ = framed.send(frames::error(ErrorCode::Timeout)).await;
            return;
        }
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => {
            tracing::debug!(%peer, error = ?e, "read error before identify");
            return;
        }
        Ok(None) => return,
    };

    let vhost = match identify(&context, &line).await {
        Ok(vhost) => vhost,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "worker identify rejected");
            let _ = framed.send(frames::error(e.code())).await;
            return;
        }
    };

    if framed.send(frames::ok()).await.is_err() {
        return;
    }

    let worker_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(context.config().queue_bound);
    let cancel = root_cancel.child_token();
    vhost
        .workers()
        .register(WorkerHandle::new(worker_id, tx, cancel.clone()))
        .await;
    tracing::info!(%peer, vhost = %vhost.path(), worker = %worker_id, "worker ready");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            rpc = rx.recv() => match rpc {
                Some(frame) => {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = framed.next() => match read {
                Some(Ok(line)) => {
                    let envelope = match Envelope::decode(&line) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            // Framing violation: report once and close.
                            let _ = framed.send(frames::error(e.code())).await;
                            break;
                        }
                    };
                    match dispatch_frame(&vhost, worker_id, &envelope).await {
                        Ok(Some(reply)) => {
                            if framed.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(worker = %worker_id, error = %e, "worker op failed");
                            if framed.send(frames::error(e.code())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(worker = %worker_id, error = ?e, "worker read error");
                    break;
                }
                None => break,
            }
        }
    }

    if vhost.workers().remove(worker_id).await {
        tracing::warn!(worker = %worker_id, "worker disconnected BUSY; in-flight RPC lost");
    }
    cancel.cancel();
    tracing::info!(%peer, worker = %worker_id, "worker disconnected");
}

// ============================================================================
// Frame handling
// ============================================================================

async fn identify(context: &Context, line: &str) -> BrokerResult<Arc<Vhost>> {
    let envelope = Envelope::decode(line)?;
    if envelope.event != frames::FRAME_IDENTIFY {
        return Err(BrokerError::Unauthorized);
    }
    let path = envelope.str_field("vhost")?;
    let secret = envelope.str_field("secret")?;

    let vhost = context.vhost(path).await?;
    vhost.authenticate_worker(secret)?;
    Ok(vhost)
}

/// Serve one post-IDENTIFY frame. `Ok(Some(_))` is the reply to write,
/// `Ok(None)` means no reply (`ACK`), and `Err` becomes an `ERROR` frame on
/// the same connection.
async fn dispatch_frame(
    vhost: &Arc<Vhost>,
    worker_id: Uuid,
    envelope: &Envelope,
) -> BrokerResult<Option<String>> {
    match envelope.event.as_str() {
        frames::FRAME_ACK => {
            // BUSY → READY; a stray ACK from a READY worker is a no-op.
            vhost.workers().ack(worker_id).await;
            Ok(None)
        }
        frames::FRAME_PUBLISH => {
            let name = envelope.str_field("channel")?;
            let event = envelope.str_field("event")?;
            if protocol::is_reserved_event(event) {
                return Err(BrokerError::InvalidPayload(format!(
                    "reserved event name {event:?}"
                )));
            }
            let channel = vhost
                .channel(name)
                .await
                .ok_or_else(|| BrokerError::ChannelNotFound(name.to_owned()))?;
            let frame = protocol::event_frame(event, name, envelope.field("data"));
            channel.publish(&frame).await;
            Ok(Some(frames::ok()))
        }
        frames::FRAME_OPEN_CHANNEL => {
            vhost.open_channel(envelope.str_field("name")?).await?;
            Ok(Some(frames::ok()))
        }
        frames::FRAME_DELETE_CHANNEL => {
            vhost.delete_channel(envelope.str_field("name")?).await?;
            Ok(Some(frames::ok()))
        }
        frames::FRAME_ADD_USER => {
            let name = envelope.str_field("name")?;
            let mask = envelope
                .payload
                .get("permissions")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| {
                    BrokerError::InvalidPayload(
                        "ADD_USER: missing required field \"permissions\"".into(),
                    )
                })?;
            vhost.add_user(name, Permissions::from_mask(mask)).await?;
            Ok(Some(frames::ok()))
        }
        frames::FRAME_DELETE_USER => {
            vhost.delete_user(envelope.str_field("name")?).await?;
            Ok(Some(frames::ok()))
        }
        frames::FRAME_REQUEST_TOKEN => {
            let user = envelope.str_field("user")?;
            let token = vhost.generate_single_access_token(user).await?;
            Ok(Some(frames::token(&token)))
        }
        other => Err(BrokerError::InvalidPayload(format!(
            "unknown frame {other:?}"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Subscriber;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn test_vhost() -> Arc<Vhost> {
        Arc::new(Vhost::new("/test", Duration::from_secs(300)))
    }

    async fn run(vhost: &Arc<Vhost>, frame: &str) -> BrokerResult<Option<String>> {
        let envelope = Envelope::decode(frame).unwrap();
        dispatch_frame(vhost, Uuid::new_v4(), &envelope).await
    }

    #[tokio::test]
    async fn open_and_delete_channel_reply_ok() {
        let vhost = test_vhost();
        let reply = run(&vhost, r#"{"OPEN_CHANNEL":{"name":"room"}}"#)
            .await
            .unwrap();
        assert_eq!(reply.unwrap(), frames::ok());
        assert!(vhost.channel("room").await.is_some());

        let reply = run(&vhost, r#"{"DELETE_CHANNEL":{"name":"room"}}"#)
            .await
            .unwrap();
        assert_eq!(reply.unwrap(), frames::ok());
        assert!(vhost.channel("room").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_open_channel_errors() {
        let vhost = test_vhost();
        run(&vhost, r#"{"OPEN_CHANNEL":{"name":"room"}}"#)
            .await
            .unwrap();
        let err = run(&vhost, r#"{"OPEN_CHANNEL":{"name":"room"}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ChannelExists);
    }

    #[tokio::test]
    async fn publish_fans_out_and_acknowledges() {
        let vhost = test_vhost();
        let channel = vhost.open_channel("room").await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        channel
            .subscribe(Subscriber::new(Uuid::new_v4(), tx, CancellationToken::new()))
            .await;

        let reply = run(
            &vhost,
            r#"{"PUBLISH":{"channel":"room","event":"msg","data":{"x":"1"}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply.unwrap(), frames::ok());
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"{"msg":{"channel":"room","data":{"x":"1"}}}"#
        );
    }

    #[tokio::test]
    async fn publish_to_missing_channel_errors() {
        let vhost = test_vhost();
        let err = run(
            &vhost,
            r#"{"PUBLISH":{"channel":"nope","event":"msg","data":{}}}"#,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ChannelNotFound);
    }

    #[tokio::test]
    async fn publish_rejects_reserved_event_names() {
        let vhost = test_vhost();
        vhost.open_channel("room").await.unwrap();
        let err = run(
            &vhost,
            r#"{"PUBLISH":{"channel":"room","event":"__heartbeat__","data":{}}}"#,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn add_user_parses_the_permission_mask() {
        let vhost = test_vhost();
        run(&vhost, r#"{"ADD_USER":{"name":"alice","permissions":3}}"#)
            .await
            .unwrap();
        let user = vhost.user("alice").await.unwrap();
        assert!(user.permissions.can_read());
        assert!(user.permissions.can_write());
    }

    #[tokio::test]
    async fn add_user_without_mask_is_invalid_payload() {
        let vhost = test_vhost();
        let err = run(&vhost, r#"{"ADD_USER":{"name":"alice"}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn delete_user_errors_when_missing() {
        let vhost = test_vhost();
        let err = run(&vhost, r#"{"DELETE_USER":{"name":"ghost"}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserNotFound);
    }

    #[tokio::test]
    async fn request_token_mints_a_redeemable_token() {
        let vhost = test_vhost();
        run(&vhost, r#"{"ADD_USER":{"name":"alice","permissions":1}}"#)
            .await
            .unwrap();
        let reply = run(&vhost, r#"{"REQUEST_SINGLE_ACCESS_TOKEN":{"user":"alice"}}"#)
            .await
            .unwrap()
            .unwrap();

        let envelope = Envelope::decode(&reply).unwrap();
        assert_eq!(envelope.event, frames::FRAME_TOKEN);
        let token = envelope.str_field("token").unwrap();
        let user = vhost.validate_single_access_token(token).await.unwrap();
        assert_eq!(user.name, "alice");
    }

    #[tokio::test]
    async fn ack_returns_a_busy_worker_to_ready() {
        let vhost = test_vhost();
        let (tx, mut rx) = mpsc::channel(8);
        let worker_id = Uuid::new_v4();
        vhost
            .workers()
            .register(WorkerHandle::new(worker_id, tx, CancellationToken::new()))
            .await;
        vhost.workers().dispatch("rpc".into()).await;
        assert_eq!(rx.recv().await.unwrap(), "rpc");
        assert_eq!(vhost.workers().busy_count().await, 1);

        let envelope = Envelope::decode(r#"{"ACK":{}}"#).unwrap();
        let reply = dispatch_frame(&vhost, worker_id, &envelope).await.unwrap();
        assert!(reply.is_none(), "ACK must not produce a reply frame");
        assert_eq!(vhost.workers().idle_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_frame_is_invalid_payload() {
        let vhost = test_vhost();
        let err = run(&vhost, r#"{"WHAT":{}}"#).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }
}
