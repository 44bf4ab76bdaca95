//! Anthropic Claude client (Messages API)

use super::{
    post_json, read_json, ContentBlock, GenerationOptions, LlmClient, LlmResponse, Message,
    SseBuffer, StreamEvent, TokenUsage, ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use keel_core::Result;
use serde::Deserialize;
use tokio::sync::mpsc;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude client
pub struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    options: GenerationOptions,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
            options: GenerationOptions::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = super::normalize_base_url(&base_url);
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    fn build_request(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> serde_json::Value {
        let mut request = serde_json::json!({
            "model": self.model,
            "max_tokens": self.options.max_tokens,
            "temperature": self.options.temperature,
            "messages": messages,
        });

        if let Some(sys) = system {
            request["system"] = serde_json::json!(sys);
        }

        if !tools.is_empty() {
            let tool_defs: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            request["tools"] = serde_json::json!(tool_defs);
        }

        request
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse> {
        let request_body = self.build_request(messages, system, tools);
        let headers = [
            ("x-api-key", self.api_key.as_str()),
            ("anthropic-version", API_VERSION),
        ];

        let response =
            post_json(PROVIDER, &self.client, &self.url(), &headers, &request_body).await?;
        let response: AnthropicResponse = read_json(PROVIDER, response).await?;

        tracing::debug!("Anthropic response: {:?}", response);

        let content: Vec<ContentBlock> = response
            .content
            .into_iter()
            .filter_map(AnthropicContentBlock::into_block)
            .collect();

        Ok(LlmResponse {
            message: Message::assistant(content),
            usage: TokenUsage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
                total_tokens: response.usage.input_tokens + response.usage.output_tokens,
            },
            stop_reason: response.stop_reason,
        })
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let mut request_body = self.build_request(messages, system, tools);
        request_body["stream"] = serde_json::json!(true);
        let headers = [
            ("x-api-key", self.api_key.as_str()),
            ("anthropic-version", API_VERSION),
        ];

        let response =
            post_json(PROVIDER, &self.client, &self.url(), &headers, &request_body).await?;

        let (tx, rx) = mpsc::channel(100);

        // Spawn task to process SSE stream
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut sse = SseBuffer::default();
            let mut state = StreamState::default();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!("Stream error: {}", e);
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                for data in sse.push(&chunk) {
                    let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(&data) else {
                        tracing::debug!("Skipping unrecognised stream event: {}", data);
                        continue;
                    };
                    for out in state.apply(event) {
                        if tx.send(out).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Accumulates content blocks while a response streams in.
#[derive(Debug, Default)]
struct StreamState {
    content_blocks: Vec<ContentBlock>,
    text: String,
    tool_id: String,
    tool_name: String,
    tool_input: String,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

impl StreamState {
    fn apply(&mut self, event: AnthropicStreamEvent) -> Vec<StreamEvent> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.usage.prompt_tokens = message.usage.input_tokens;
                Vec::new()
            }
            AnthropicStreamEvent::ContentBlockStart { content_block } => match content_block {
                AnthropicContentBlock::ToolUse { id, name, .. } => {
                    self.tool_id = id.clone();
                    self.tool_name = name.clone();
                    self.tool_input.clear();
                    vec![StreamEvent::ToolUseStart { id, name }]
                }
                _ => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { delta } => match delta {
                AnthropicDelta::TextDelta { text } => {
                    self.text.push_str(&text);
                    vec![StreamEvent::TextDelta(text)]
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    self.tool_input.push_str(&partial_json);
                    vec![StreamEvent::ToolUseInputDelta(partial_json)]
                }
                AnthropicDelta::Other => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockStop {} => {
                if !self.text.is_empty() {
                    self.content_blocks.push(ContentBlock::Text {
                        text: std::mem::take(&mut self.text),
                    });
                }
                if !self.tool_id.is_empty() {
                    let input = if self.tool_input.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&self.tool_input).unwrap_or(serde_json::json!({}))
                    };
                    self.content_blocks.push(ContentBlock::ToolUse {
                        id: std::mem::take(&mut self.tool_id),
                        name: std::mem::take(&mut self.tool_name),
                        input,
                    });
                    self.tool_input.clear();
                }
                Vec::new()
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                self.usage.completion_tokens = usage.output_tokens;
                self.usage.total_tokens = self.usage.prompt_tokens + self.usage.completion_tokens;
                Vec::new()
            }
            AnthropicStreamEvent::MessageStop => {
                vec![StreamEvent::Done(LlmResponse {
                    message: Message::assistant(std::mem::take(&mut self.content_blocks)),
                    usage: self.usage.clone(),
                    stop_reason: self.stop_reason.clone(),
                })]
            }
            AnthropicStreamEvent::Error { error } => {
                vec![StreamEvent::Error(format!(
                    "{}: {}",
                    error.error_type, error.message
                ))]
            }
            AnthropicStreamEvent::Ping => Vec::new(),
        }
    }
}

// Anthropic API response types
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

impl AnthropicContentBlock {
    fn into_block(self) -> Option<ContentBlock> {
        match self {
            AnthropicContentBlock::Text { text } => Some(ContentBlock::Text { text }),
            AnthropicContentBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            AnthropicContentBlock::Other => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

// Anthropic streaming event types
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicMessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: AnthropicContentBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: AnthropicDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {},
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: AnthropicMessageDeltaData,
        usage: AnthropicOutputUsage,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: AnthropicError },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDeltaData {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicOutputUsage {
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> AnthropicStreamEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_build_request_includes_options_and_tools() {
        let client = AnthropicClient::new("key".to_string(), "claude-test".to_string())
            .with_options(GenerationOptions {
                temperature: 0.5,
                max_tokens: 1000,
            });
        let tools = vec![ToolDefinition {
            name: "read_file".to_string(),
            description: "Read".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let request = client.build_request(&[Message::user("hi")], Some("be brief"), &tools);

        assert_eq!(request["max_tokens"], 1000);
        assert_eq!(request["system"], "be brief");
        assert_eq!(request["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(request["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn test_stream_state_assembles_tool_use() {
        let mut state = StreamState::default();
        state.apply(event(r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0}}}"#));
        let started = state.apply(event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"read_file","input":{}}}"#,
        ));
        assert!(matches!(&started[0], StreamEvent::ToolUseStart { name, .. } if name == "read_file"));
        state.apply(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
        ));
        state.apply(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"a.txt\"}"}}"#,
        ));
        state.apply(event(r#"{"type":"content_block_stop","index":0}"#));
        state.apply(event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":7}}"#,
        ));
        let done = state.apply(event(r#"{"type":"message_stop"}"#));

        let StreamEvent::Done(response) = &done[0] else {
            panic!("expected Done");
        };
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["path"], "a.txt");
        assert_eq!(response.usage.total_tokens, 19);
    }

    #[test]
    fn test_stream_state_collects_text() {
        let mut state = StreamState::default();
        state.apply(event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        ));
        let delta = state.apply(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        ));
        assert!(matches!(&delta[0], StreamEvent::TextDelta(t) if t == "Hello"));
        state.apply(event(r#"{"type":"content_block_stop","index":0}"#));
        let done = state.apply(event(r#"{"type":"message_stop"}"#));
        let StreamEvent::Done(response) = &done[0] else {
            panic!("expected Done");
        };
        assert_eq!(response.text(), "Hello");
    }
}
