//! Fluent request builder

use super::{HttpRequests, SendOptions};
use crate::error::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Request assembled step by step and sent through [`HttpRequests::send_buffer`].
///
/// Setting a body picks a content type unless one was set explicitly.
pub struct RequestBuilder {
    requests: HttpRequests,
    url: String,
    method: String,
    body: Option<Bytes>,
    content_type: Option<String>,
    options: SendOptions,
    json_error: Option<serde_json::Error>,
}

impl RequestBuilder {
    pub(crate) fn new(requests: HttpRequests, url: String) -> Self {
        Self {
            requests,
            url,
            method: "GET".to_string(),
            body: None,
            content_type: None,
            options: SendOptions::default(),
            json_error: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn body_text(mut self, text: impl Into<String>) -> Self {
        self.body = Some(Bytes::from(text.into()));
        self.content_type.get_or_insert_with(|| "text/plain".to_string());
        self
    }

    pub fn body_json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(json) => self.body = Some(Bytes::from(json)),
            Err(e) => self.json_error = Some(e),
        }
        self.content_type.get_or_insert_with(|| "application/json".to_string());
        self
    }

    pub fn body_buffer(mut self, buffer: impl Into<Bytes>) -> Self {
        self.body = Some(buffer.into());
        self.content_type
            .get_or_insert_with(|| "application/octet-stream".to_string());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub async fn response_buffer(self) -> Result<Bytes> {
        if let Some(e) = self.json_error {
            return Err(e.into());
        }
        self.requests
            .send_buffer(
                &self.url,
                &self.method,
                self.body,
                self.content_type.as_deref(),
                &self.options,
            )
            .await
    }

    pub async fn response_text(self) -> Result<String> {
        let body = self.response_buffer().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn response_json<T: DeserializeOwned>(self) -> Result<T> {
        let body = self.response_buffer().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
