use reqwest::{RequestBuilder, Response, Url};
use tracing::debug;

use super::{ChatApi, HistoryFetchError, ReadStatusError, RequestError, SendError};
use crate::config::ChatConfig;
use crate::models::envelope;
use crate::models::messages::{MessagePage, NewMessage, ReadStatus, ReadStatusUpdate};
use crate::models::{HistoryQuery, MessageId, RoomId};

/// [`ChatApi`] over the backend's REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: Url, access_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            access_token,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.api_base_url.clone(), config.access_token.clone())
    }

    /// `{base}/chat/rooms/{room_id}/{tail}`
    fn room_url(&self, room_id: RoomId, tail: &str) -> Result<Url, RequestError> {
        let room = room_id.to_string();
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RequestError::Invalid(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(["chat", "rooms", room.as_str(), tail]);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_history(
        &self,
        room_id: RoomId,
        query: &HistoryQuery,
    ) -> Result<MessagePage, RequestError> {
        let url = self.room_url(room_id, "messages")?;
        debug!("GET {url} cursor={:?} size={}", query.cursor, query.size);

        let response = self
            .authorize(self.client.get(url))
            .query(query)
            .send()
            .await?;
        let body = success_body(response).await?;
        Ok(envelope::decode(&body)?)
    }

    async fn post_message(&self, room_id: RoomId, message: &NewMessage) -> Result<(), RequestError> {
        message.validate().map_err(RequestError::Invalid)?;

        let url = self.room_url(room_id, "messages")?;
        debug!("POST {url} ({:?})", message.body.kind());

        let response = self
            .authorize(self.client.post(url))
            .json(message)
            .send()
            .await?;
        success_body(response).await?;
        Ok(())
    }

    async fn patch_read(
        &self,
        room_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<ReadStatus, RequestError> {
        let url = self.room_url(room_id, "read")?;
        debug!("PATCH {url} lastReadMessageId={last_read_message_id}");

        let response = self
            .authorize(self.client.patch(url))
            .json(&ReadStatusUpdate {
                last_read_message_id,
            })
            .send()
            .await?;
        let body = success_body(response).await?;
        Ok(envelope::decode(&body)?)
    }
}

impl ChatApi for HttpChatApi {
    async fn fetch_history(
        &self,
        room_id: RoomId,
        query: &HistoryQuery,
    ) -> Result<MessagePage, HistoryFetchError> {
        self.get_history(room_id, query)
            .await
            .map_err(|source| HistoryFetchError { room_id, source })
    }

    async fn send_message(&self, room_id: RoomId, message: &NewMessage) -> Result<(), SendError> {
        self.post_message(room_id, message)
            .await
            .map_err(|source| SendError { room_id, source })
    }

    async fn update_read_status(
        &self,
        room_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<ReadStatus, ReadStatusError> {
        self.patch_read(room_id, last_read_message_id)
            .await
            .map_err(|source| ReadStatusError { room_id, source })
    }
}

/// The response body, or a [`RequestError::Status`] for non-2xx answers.
async fn success_body(response: Response) -> Result<String, RequestError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(RequestError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}
