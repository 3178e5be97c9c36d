use crate::ai::{check_status, parse_json};
use crate::Result;
use reqwest::multipart::Form;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

const DIALECT: &str = "OpenAI";

/// Bearer-authenticated client for an OpenAI-compatible REST API.
pub struct OpenAiHttpClient {
    pub(crate) client: Client,
    pub(crate) api_key: String,
    pub(crate) base_url: String,
}

impl OpenAiHttpClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self::new_with_client(api_key, base_url, Client::new())
    }

    pub fn new_with_client(api_key: String, base_url: String, client: Client) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a JSON body and hand back the raw response for streaming.
    pub async fn post_streaming<Req: Serialize>(&self, path: &str, request: &Req) -> Result<Response> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send request to {}: {}", DIALECT, e);
                e
            })?;

        check_status(DIALECT, response).await
    }

    pub async fn post_multipart<Resp: DeserializeOwned>(&self, path: &str, form: Form) -> Result<Resp> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send multipart request to {}: {}", DIALECT, e);
                e
            })?;

        let response = check_status(DIALECT, response).await?;
        parse_json(DIALECT, response).await
    }

    pub async fn get<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let response = check_status(DIALECT, response).await?;
        parse_json(DIALECT, response).await
    }
}
