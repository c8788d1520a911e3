use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MessagePayload, UploadResponse},
};

use crate::error::ClientError;

/// Collaborator HTTP routes served next to the websocket endpoint.
#[derive(Clone)]
pub struct HttpClient {
    http: Client,
    server_url: String,
}

impl HttpClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let server_url: String = server_url.into();
        Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn history(
        &self,
        token: &str,
        peer: UserId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset));
        }
        let response = self
            .http
            .get(format!("{}/messages/{}", self.server_url, peer.0))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn conversations(
        &self,
        token: &str,
    ) -> Result<Vec<ConversationSummary>, ClientError> {
        let response = self
            .http
            .get(format!("{}/conversations", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn upload(
        &self,
        token: &str,
        kind: MessageKind,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ClientError> {
        if !kind.carries_upload() {
            return Err(ClientError::Invalid(format!(
                "`{}` messages do not carry an upload",
                kind.as_str()
            )));
        }
        let mut part = multipart::Part::bytes(bytes).file_name(filename.to_string());
        if let Some(mime_type) = mime_type {
            part = part.mime_str(mime_type)?;
        }
        let form = multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/files/upload", self.server_url))
            .bearer_auth(token)
            .query(&[("message_type", kind.as_str())])
            .multipart(form)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn download(&self, token: &str, filename: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(format!("{}/files/{filename}", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(rejection(response).await);
    }
    Ok(response.json().await?)
}

async fn rejection(response: Response) -> ClientError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(err) => ClientError::Api {
            code: err.code,
            message: err.message,
        },
        Err(_) => ClientError::Api {
            code: ErrorCode::Internal,
            message: format!("server returned {status}"),
        },
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
