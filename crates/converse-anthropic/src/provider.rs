//! The Anthropic provider client.

use converse::chunk::{error_stream, ChunkStream, StreamError};
use converse::message::Message;
use converse::provider::{ProviderClient, ProviderMetadata, StreamConfig};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::instrument;

use crate::config::AnthropicConfig;
use crate::convert::{build_request, convert_error, transport_error};
use crate::stream::into_stream;

/// Streams chat completions from the Anthropic Messages API.
///
/// Construct with [`AnthropicClient::new`] and register in a
/// [`ProviderRegistry`](converse::provider::ProviderRegistry), or use
/// directly through [`ProviderClient`].
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicClient {
    /// Creates a client from `config`, reusing `config.client` when one
    /// is provided.
    pub fn new(config: AnthropicConfig) -> Self {
        let client = config.client.clone().unwrap_or_else(|| {
            let mut builder = reqwest::Client::builder();
            if let Some(timeout) = config.timeout {
                builder = builder.timeout(timeout);
            }
            // Builder only fails on TLS backend misconfiguration; fall
            // back to the default client rather than panic.
            builder.build().unwrap_or_default()
        });
        Self { config, client }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/v1/messages",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn default_headers(&self) -> Result<HeaderMap, StreamError> {
        let mut headers = HeaderMap::new();
        let api_key =
            HeaderValue::from_str(&self.config.api_key).map_err(|_| StreamError {
                message: "API key contains invalid header characters".into(),
                status: None,
            })?;
        let version =
            HeaderValue::from_str(&self.config.api_version).map_err(|_| StreamError {
                message: "API version contains invalid header characters".into(),
                status: None,
            })?;
        headers.insert("x-api-key", api_key);
        headers.insert("anthropic-version", version);
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

impl ProviderClient for AnthropicClient {
    #[instrument(skip_all, fields(model = %config.model))]
    async fn stream(&self, messages: &[Message], config: &StreamConfig) -> ChunkStream {
        let (body, withheld_prefill) = match build_request(messages, &self.config, config) {
            Ok(request) => request,
            Err(err) => {
                return error_stream(StreamError {
                    message: err.to_string(),
                    status: None,
                })
            }
        };
        let headers = match self.default_headers() {
            Ok(headers) => headers,
            Err(err) => return error_stream(err),
        };

        let response = match self
            .client
            .post(self.messages_url())
            .headers(headers)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return error_stream(transport_error(&err)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return error_stream(convert_error(status.as_u16(), &body));
        }

        into_stream(response, withheld_prefill)
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "anthropic".into(),
            model: self.config.model.clone(),
            context_window: context_window_for_model(&self.config.model),
        }
    }
}

fn context_window_for_model(model: &str) -> u64 {
    if model.starts_with("claude") {
        200_000
    } else {
        100_000
    }
}
