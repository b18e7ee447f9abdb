//! JSON-over-HTTP client for the IM engine.

use super::ImEngine;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use sync_types::engine::{
    ChannelMessagesPage, ChannelMessagesRequest, ClearUnreadRequest, ConversationSnapshot,
    FetchConversationsRequest,
};
use sync_types::{ChannelKey, ChannelType};

const CONVERSATION_SYNC: &str = "/conversation/sync";
const CHANNEL_MESSAGE_SYNC: &str = "/channel/messagesync";
const CHANNEL_MEMBER_EXIST: &str = "/channel/member/exist";
const GROUP_MEMBERS_EXIST: &str = "/group/member/exists";
const USER_BROADCAST_CHANNELS: &str = "/user/broadcast_channels";
const CONVERSATION_SET_UNREAD: &str = "/conversations/setUnread";

#[derive(Serialize)]
struct MemberExistRequest<'a> {
    channel_id: &'a str,
    channel_type: ChannelType,
    uid: &'a str,
}

#[derive(Deserialize)]
struct MemberExistResponse {
    #[serde(default)]
    exist: u8,
}

#[derive(Serialize)]
struct MembersExistRequest<'a> {
    group_nos: &'a [String],
    uid: &'a str,
}

#[derive(Serialize)]
struct UidRequest<'a> {
    uid: &'a str,
}

/// Client for the IM engine's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpImEngine {
    base_url: String,
    http: reqwest::Client,
}

impl HttpImEngine {
    /// Create a client for the engine at `config.api_url`.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized + Sync>(
        &self,
        path: &'static str,
        body: &B,
    ) -> EngineResult<reqwest::Response> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                path,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn post<B: Serialize + ?Sized + Sync, R: DeserializeOwned>(
        &self,
        path: &'static str,
        body: &B,
    ) -> EngineResult<R> {
        let bytes = self.send(path, body).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode {
            path,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ImEngine for HttpImEngine {
    async fn fetch_user_conversations(
        &self,
        req: &FetchConversationsRequest,
    ) -> EngineResult<Vec<ConversationSnapshot>> {
        // The engine answers `null` when nothing changed.
        let conversations: Option<Vec<ConversationSnapshot>> =
            self.post(CONVERSATION_SYNC, req).await?;
        Ok(conversations.unwrap_or_default())
    }

    async fn fetch_channel_messages(
        &self,
        req: &ChannelMessagesRequest,
    ) -> EngineResult<ChannelMessagesPage> {
        let page: Option<ChannelMessagesPage> = self.post(CHANNEL_MESSAGE_SYNC, req).await?;
        Ok(page.unwrap_or_default())
    }

    async fn is_channel_member(&self, channel: &ChannelKey, uid: &str) -> EngineResult<bool> {
        let response: MemberExistResponse = self
            .post(
                CHANNEL_MEMBER_EXIST,
                &MemberExistRequest {
                    channel_id: &channel.channel_id,
                    channel_type: channel.channel_type,
                    uid,
                },
            )
            .await?;
        Ok(response.exist == 1)
    }

    async fn member_groups(
        &self,
        group_ids: &[String],
        uid: &str,
    ) -> EngineResult<HashSet<String>> {
        let groups: Option<Vec<String>> = self
            .post(
                GROUP_MEMBERS_EXIST,
                &MembersExistRequest {
                    group_nos: group_ids,
                    uid,
                },
            )
            .await?;
        Ok(groups.unwrap_or_default().into_iter().collect())
    }

    async fn broadcast_channels(&self, uid: &str) -> EngineResult<Vec<ChannelKey>> {
        let channels: Option<Vec<ChannelKey>> =
            self.post(USER_BROADCAST_CHANNELS, &UidRequest { uid }).await?;
        Ok(channels.unwrap_or_default())
    }

    async fn clear_unread(&self, req: &ClearUnreadRequest) -> EngineResult<()> {
        self.send(CONVERSATION_SET_UNREAD, req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use sync_types::Version;

    async fn fake_engine() -> String {
        let app = Router::new()
            .route(
                CONVERSATION_SYNC,
                post(|Json(req): Json<FetchConversationsRequest>| async move {
                    Json(serde_json::json!([{
                        "channel_id": "g1",
                        "channel_type": 2,
                        "unread": 1,
                        "last_msg_seq": 9,
                        "version": req.version.value() + 10,
                        "recents": [{
                            "message_id": 77,
                            "message_seq": 9,
                            "from_uid": "bob",
                            "channel_id": "g1",
                            "channel_type": 2,
                            "payload": "eyJ0eXBlIjoxfQ=="
                        }]
                    }]))
                }),
            )
            .route(
                CHANNEL_MEMBER_EXIST,
                post(|| async { Json(serde_json::json!({"exist": 1})) }),
            )
            .route(
                GROUP_MEMBERS_EXIST,
                post(|Json(req): Json<serde_json::Value>| async move {
                    // Member of every group except "left".
                    let groups: Vec<serde_json::Value> = req["group_nos"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|g| g != "left")
                        .collect();
                    Json(groups)
                }),
            )
            .route(
                USER_BROADCAST_CHANNELS,
                post(|| async { Json(serde_json::Value::Null) }),
            )
            .route(
                CONVERSATION_SET_UNREAD,
                post(|| async { (StatusCode::BAD_REQUEST, "unknown channel") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn client(url: String) -> HttpImEngine {
        HttpImEngine::new(&EngineConfig {
            api_url: url,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let engine = client("http://im:5001/".into());
        assert_eq!(engine.base_url(), "http://im:5001");
        assert_eq!(
            engine.url(CONVERSATION_SYNC),
            "http://im:5001/conversation/sync"
        );
    }

    #[tokio::test]
    async fn decodes_conversations_and_payloads() {
        let engine = client(fake_engine().await);
        let conversations = engine
            .fetch_user_conversations(&FetchConversationsRequest {
                uid: "alice".into(),
                version: Version::new(5),
                last_msg_seqs: String::new(),
                msg_count: 20,
                larges: vec![],
            })
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].version, Version::new(15));
        let payload = conversations[0].recents[0].payload_json().unwrap();
        assert_eq!(payload["type"], 1);
    }

    #[tokio::test]
    async fn membership_and_null_lists() {
        let engine = client(fake_engine().await);
        assert!(engine
            .is_channel_member(&ChannelKey::group("g1"), "alice")
            .await
            .unwrap());
        assert!(engine.broadcast_channels("alice").await.unwrap().is_empty());

        let groups = engine
            .member_groups(&["g1".to_string(), "left".to_string()], "alice")
            .await
            .unwrap();
        assert_eq!(groups, HashSet::from(["g1".to_string()]));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let engine = client(fake_engine().await);
        let err = engine
            .clear_unread(&ClearUnreadRequest {
                uid: "alice".into(),
                channel_id: "g1".into(),
                channel_type: ChannelType::Group,
                unread: 0,
                message_seq: 3,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Status {
                status: 400,
                ref body,
                ..
            } if body == "unknown channel"
        ));
    }

    #[tokio::test]
    async fn unreachable_engine_is_transport_error() {
        let engine = client("http://127.0.0.1:1".into());
        let err = engine.broadcast_channels("alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }
}
