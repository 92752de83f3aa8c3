//! App Messages
//!
//! JSON messages sent by the app to the running tunnel, and the handler
//! that turns them into actor events. API requests are passed through to
//! an [`ApiProxy`] without interpretation.
//!
//! | Message               | Reply            |
//! |-----------------------|------------------|
//! | `reconnect_tunnel`    | none             |
//! | `get_tunnel_status`   | `TunnelStatus`   |
//! | `send_api_request`    | `ApiResponse`    |
//! | `cancel_api_request`  | none             |
//! | `private_key_rotation`| none             |

use crate::actor::ActorHandle;
use crate::reducer::NextRelaySelection;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, warn};

/// Opaque API request forwarded through the tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub id: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message from the app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum TunnelProviderMessage {
    ReconnectTunnel(NextRelaySelection),
    GetTunnelStatus,
    SendApiRequest(ApiRequest),
    CancelApiRequest { id: u64 },
    PrivateKeyRotation,
}

impl TunnelProviderMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::EncodeError(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(data).map_err(|e| MessageError::DecodeError(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReconnectTunnel(_) => "reconnect_tunnel",
            Self::GetTunnelStatus => "get_tunnel_status",
            Self::SendApiRequest(_) => "send_api_request",
            Self::CancelApiRequest { .. } => "cancel_api_request",
            Self::PrivateKeyRotation => "private_key_rotation",
        }
    }
}

/// Message errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    EncodeError(String),

    #[error("Failed to decode message: {0}")]
    DecodeError(String),
}

/// Performs API requests on behalf of the app
pub trait ApiProxy: Send + Sync {
    fn send_request(&self, request: ApiRequest) -> impl Future<Output = ApiResponse> + Send;

    fn cancel_request(&self, id: u64);
}

/// Proxy for deployments without API access, every request fails
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineApiProxy;

impl ApiProxy for OfflineApiProxy {
    async fn send_request(&self, request: ApiRequest) -> ApiResponse {
        ApiResponse {
            id: request.id,
            payload: None,
            error: Some("API access unavailable".to_string()),
        }
    }

    fn cancel_request(&self, _id: u64) {}
}

/// Dispatches app messages to the actor and the API proxy
pub struct AppMessageHandler<P: ApiProxy> {
    actor: ActorHandle,
    proxy: P,
}

impl<P: ApiProxy> AppMessageHandler<P> {
    pub fn new(actor: ActorHandle, proxy: P) -> Self {
        Self { actor, proxy }
    }

    /// Handle one encoded message, returning the encoded reply if any.
    ///
    /// Malformed messages are logged and get no reply.
    pub async fn handle(&self, data: &[u8]) -> Option<Vec<u8>> {
        let message = match TunnelProviderMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        debug!("Received app message: {}", message.name());

        match message {
            TunnelProviderMessage::ReconnectTunnel(selection) => {
                if let Err(e) = self.actor.reconnect(selection) {
                    warn!("Reconnect not delivered: {}", e);
                }
                None
            }
            TunnelProviderMessage::GetTunnelStatus => encode_reply(&self.actor.status()),
            TunnelProviderMessage::SendApiRequest(request) => {
                let response = self.proxy.send_request(request).await;
                encode_reply(&response)
            }
            TunnelProviderMessage::CancelApiRequest { id } => {
                self.proxy.cancel_request(id);
                None
            }
            TunnelProviderMessage::PrivateKeyRotation => {
                if let Err(e) = self.actor.notify_key_rotated(Utc::now()) {
                    warn!("Key rotation not delivered: {}", e);
                }
                None
            }
        }
    }
}

fn encode_reply<T: Serialize>(reply: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(reply) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("Failed to encode reply: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{Event, ReconnectReason};
    use crate::state::{StateKind, TunnelStatus};
    use std::sync::Mutex;

    #[derive(Default)]
    struct EchoProxy {
        cancelled: Mutex<Vec<u64>>,
    }

    impl ApiProxy for EchoProxy {
        async fn send_request(&self, request: ApiRequest) -> ApiResponse {
            ApiResponse {
                id: request.id,
                payload: Some(request.payload),
                error: None,
            }
        }

        fn cancel_request(&self, id: u64) {
            self.cancelled.lock().unwrap().push(id);
        }
    }

    #[test]
    fn test_message_wire_format() {
        let message = TunnelProviderMessage::CancelApiRequest { id: 7 };
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "cancel_api_request");
        assert_eq!(json["body"]["id"], 7);

        let decoded = TunnelProviderMessage::decode(br#"{"type":"reconnect_tunnel","body":"random"}"#);
        assert_eq!(
            decoded,
            Ok(TunnelProviderMessage::ReconnectTunnel(NextRelaySelection::Random))
        );
    }

    #[tokio::test]
    async fn test_malformed_message_gets_no_reply() {
        let (actor, mut events, _status) = ActorHandle::detached();
        let handler = AppMessageHandler::new(actor, EchoProxy::default());

        assert_eq!(handler.handle(b"not json").await, None);
        assert_eq!(handler.handle(br#"{"type":"format_disk"}"#).await, None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_forwarded_to_actor() {
        let (actor, mut events, _status) = ActorHandle::detached();
        let handler = AppMessageHandler::new(actor, EchoProxy::default());
        let message = TunnelProviderMessage::ReconnectTunnel(NextRelaySelection::Current);

        assert_eq!(handler.handle(&message.encode().unwrap()).await, None);
        assert_eq!(
            events.try_recv().unwrap(),
            Event::Reconnect {
                selection: NextRelaySelection::Current,
                reason: ReconnectReason::UserInitiated,
            }
        );
    }

    #[tokio::test]
    async fn test_status_reply() {
        let (actor, _events, status) = ActorHandle::detached();
        let handler = AppMessageHandler::new(actor, EchoProxy::default());
        status.send_replace(TunnelStatus {
            number_of_failed_attempts: 2,
            ..TunnelStatus::default()
        });

        let message = TunnelProviderMessage::GetTunnelStatus.encode().unwrap();
        let reply = handler.handle(&message).await.unwrap();
        let decoded: TunnelStatus = serde_json::from_slice(&reply).unwrap();

        assert_eq!(decoded.state, StateKind::Initial);
        assert_eq!(decoded.number_of_failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_api_requests_pass_through() {
        let (actor, _events, _status) = ActorHandle::detached();
        let handler = AppMessageHandler::new(actor, EchoProxy::default());
        let request = TunnelProviderMessage::SendApiRequest(ApiRequest {
            id: 3,
            payload: serde_json::json!({ "path": "/app/v1/relays" }),
        });

        let reply = handler.handle(&request.encode().unwrap()).await.unwrap();
        let response: ApiResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(response.id, 3);
        assert_eq!(response.payload.unwrap()["path"], "/app/v1/relays");

        let cancel = TunnelProviderMessage::CancelApiRequest { id: 3 };
        assert_eq!(handler.handle(&cancel.encode().unwrap()).await, None);
        assert_eq!(*handler.proxy.cancelled.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_key_rotation_notifies_actor() {
        let (actor, mut events, _status) = ActorHandle::detached();
        let handler = AppMessageHandler::new(actor, OfflineApiProxy);

        let message = TunnelProviderMessage::PrivateKeyRotation.encode().unwrap();
        assert_eq!(handler.handle(&message).await, None);
        assert!(matches!(events.try_recv(), Ok(Event::NotifyKeyRotated(_))));
    }
}
