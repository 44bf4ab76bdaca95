//! OpenAI client (Chat Completions API)

use super::{
    post_json, read_json, ContentBlock, GenerationOptions, LlmClient, LlmResponse, Message,
    SseBuffer, StreamEvent, TokenUsage, ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use keel_core::{KeelError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

const PROVIDER: &str = "openai";

/// OpenAI client
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    options: GenerationOptions,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com".to_string(),
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

    fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        let mut converted = Vec::with_capacity(messages.len());
        for msg in messages {
            // Tool results become one "tool" message each
            let mut plain = Vec::new();
            for block in &msg.content {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = block
                {
                    converted.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    }));
                } else {
                    plain.push(block);
                }
            }
            if plain.is_empty() {
                continue;
            }

            if msg.role == "assistant" {
                let tool_calls = msg.tool_calls();
                if !tool_calls.is_empty() {
                    converted.push(serde_json::json!({
                        "role": "assistant",
                        "content": msg.text(),
                        "tool_calls": tool_calls.iter().map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.args.to_string(),
                                }
                            })
                        }).collect::<Vec<_>>(),
                    }));
                    continue;
                }
            }

            converted.push(serde_json::json!({
                "role": msg.role,
                "content": msg.text(),
            }));
        }
        converted
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> serde_json::Value {
        let mut openai_messages = Vec::new();
        if let Some(sys) = system {
            openai_messages.push(serde_json::json!({
                "role": "system",
                "content": sys,
            }));
        }
        openai_messages.extend(Self::convert_messages(messages));

        let mut request = serde_json::json!({
            "model": self.model,
            "messages": openai_messages,
            "temperature": self.options.temperature,
            "max_tokens": self.options.max_tokens,
        });

        if !tools.is_empty() {
            request["tools"] = serde_json::json!(Self::convert_tools(tools));
        }
        request
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse> {
        let request = self.build_request(messages, system, tools);
        let auth_header = format!("Bearer {}", self.api_key);
        let headers = [("Authorization", auth_header.as_str())];

        let response = post_json(PROVIDER, &self.client, &self.url(), &headers, &request).await?;
        let response: OpenAiResponse = read_json(PROVIDER, response).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| KeelError::provider(PROVIDER, "response contained no choices"))?;

        let mut content = vec![];
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        }
        for tc in choice.message.tool_calls.unwrap_or_default() {
            content.push(ContentBlock::ToolUse {
                id: tc.id,
                name: tc.function.name,
                input: parse_arguments(&tc.function.arguments),
            });
        }

        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            message: Message::assistant(content),
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            stop_reason: choice.finish_reason,
        })
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let mut request = self.build_request(messages, system, tools);
        request["stream"] = serde_json::json!(true);
        request["stream_options"] = serde_json::json!({ "include_usage": true });

        let auth_header = format!("Bearer {}", self.api_key);
        let headers = [("Authorization", auth_header.as_str())];
        let response = post_json(PROVIDER, &self.client, &self.url(), &headers, &request).await?;

        let (tx, rx) = mpsc::channel(100);
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
                    if data == "[DONE]" {
                        let _ = tx.send(StreamEvent::Done(state.finish())).await;
                        return;
                    }
                    let Ok(event) = serde_json::from_str::<OpenAiStreamChunk>(&data) else {
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

fn parse_arguments(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
}

/// Accumulates deltas while a chat completion streams in.
#[derive(Debug, Default)]
struct StreamState {
    text: String,
    // Keyed by the delta index so calls keep the order the model emitted them
    tool_calls: BTreeMap<usize, (String, String, String)>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

impl StreamState {
    fn apply(&mut self, chunk: OpenAiStreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(u) = chunk.usage {
            self.usage = TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            };
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
        let Some(delta) = choice.delta else {
            return events;
        };

        if let Some(content) = delta.content {
            if !content.is_empty() {
                self.text.push_str(&content);
                events.push(StreamEvent::TextDelta(content));
            }
        }

        for tc in delta.tool_calls.unwrap_or_default() {
            let entry = self
                .tool_calls
                .entry(tc.index)
                .or_insert_with(|| (String::new(), String::new(), String::new()));
            if let Some(id) = tc.id {
                entry.0 = id;
            }
            if let Some(func) = tc.function {
                if let Some(name) = func.name {
                    entry.1 = name.clone();
                    events.push(StreamEvent::ToolUseStart {
                        id: entry.0.clone(),
                        name,
                    });
                }
                if let Some(args) = func.arguments {
                    entry.2.push_str(&args);
                    events.push(StreamEvent::ToolUseInputDelta(args));
                }
            }
        }
        events
    }

    fn finish(&mut self) -> LlmResponse {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text {
                text: std::mem::take(&mut self.text),
            });
        }
        for (_, (id, name, args)) in std::mem::take(&mut self.tool_calls) {
            content.push(ContentBlock::ToolUse {
                id,
                name,
                input: parse_arguments(&args),
            });
        }
        LlmResponse {
            message: Message::assistant(content),
            usage: self.usage.clone(),
            stop_reason: self.finish_reason.clone(),
        }
    }
}

// OpenAI API response types
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

// OpenAI streaming types
#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_messages_tool_round_trip() {
        let messages = vec![
            Message::user("list files"),
            Message::assistant(vec![ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "list_directory".to_string(),
                input: serde_json::json!({"path": "."}),
            }]),
            Message::tool_result("call_1", "a.txt\nb.txt", false),
        ];

        let converted = OpenAiClient::convert_messages(&messages);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[0]["role"], "user");
        assert_eq!(converted[1]["tool_calls"][0]["function"]["name"], "list_directory");
        assert_eq!(converted[2]["role"], "tool");
        assert_eq!(converted[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_build_request_has_system_first() {
        let client = OpenAiClient::new("k".to_string(), "gpt-test".to_string());
        let request = client.build_request(&[Message::user("hi")], Some("sys"), &[]);
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][1]["content"], "hi");
        assert!(request.get("tools").is_none());
    }

    #[test]
    fn test_stream_state_keeps_tool_call_order() {
        let mut state = StreamState::default();
        let chunk = |json: &str| serde_json::from_str::<OpenAiStreamChunk>(json).unwrap();

        state.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"write_file","arguments":"{}"}}]}}]}"#,
        ));
        state.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"read_file","arguments":"{\"path\":\"x\"}"}}]}}]}"#,
        ));
        state.apply(chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
        ));

        let response = state.finish();
        let calls = response.tool_calls();
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].id, "b");
        assert_eq!(calls[0].args["path"], "x");
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[test]
    fn test_parse_arguments_tolerates_garbage() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("{oops"), serde_json::json!({}));
    }
}
