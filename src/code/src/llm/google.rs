//! Google Gemini client (generateContent API)

use super::{
    post_json, read_json, ContentBlock, GenerationOptions, LlmClient, LlmResponse, Message,
    SseBuffer, StreamEvent, TokenUsage, ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use keel_core::{KeelError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

const PROVIDER: &str = "google";

/// Google Gemini client
pub struct GoogleClient {
    api_key: String,
    model: String,
    base_url: String,
    options: GenerationOptions,
    client: reqwest::Client,
}

impl GoogleClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
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

    /// Gemini identifies function responses by name, not by call id, so the
    /// id of every tool_use seen so far is mapped back to its function name.
    fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        let mut names: HashMap<&str, &str> = HashMap::new();
        let mut contents = Vec::with_capacity(messages.len());

        for msg in messages {
            let role = if msg.role == "assistant" { "model" } else { "user" };
            let mut parts = Vec::new();
            for block in &msg.content {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            parts.push(serde_json::json!({ "text": text }));
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        names.insert(id.as_str(), name.as_str());
                        parts.push(serde_json::json!({
                            "functionCall": { "name": name, "args": input }
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let name = names.get(tool_use_id.as_str()).copied().unwrap_or(tool_use_id.as_str());
                        let key = if is_error.unwrap_or(false) { "error" } else { "output" };
                        parts.push(serde_json::json!({
                            "functionResponse": {
                                "name": name,
                                "response": { key: content },
                            }
                        }));
                    }
                }
            }
            if !parts.is_empty() {
                contents.push(serde_json::json!({ "role": role, "parts": parts }));
            }
        }
        contents
    }

    fn build_request(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> serde_json::Value {
        let mut request = serde_json::json!({
            "contents": Self::convert_messages(messages),
            "generationConfig": {
                "temperature": self.options.temperature,
                "maxOutputTokens": self.options.max_tokens,
            },
        });

        if let Some(sys) = system {
            request["systemInstruction"] = serde_json::json!({ "parts": [{ "text": sys }] });
        }

        if !tools.is_empty() {
            let declarations: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            request["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
        }
        request
    }

    fn url(&self, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, self.model, method)
    }
}

#[async_trait]
impl LlmClient for GoogleClient {
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
        let headers = [("x-goog-api-key", self.api_key.as_str())];

        let response = post_json(
            PROVIDER,
            &self.client,
            &self.url("generateContent"),
            &headers,
            &request,
        )
        .await?;
        let response: GeminiResponse = read_json(PROVIDER, response).await?;

        let mut state = StreamState::default();
        state.apply(response);
        if state.text.is_empty() && state.tool_calls.is_empty() && state.finish_reason.is_none() {
            return Err(KeelError::provider(PROVIDER, "response contained no candidates"));
        }
        Ok(state.finish())
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let request = self.build_request(messages, system, tools);
        let headers = [("x-goog-api-key", self.api_key.as_str())];
        let url = format!("{}?alt=sse", self.url("streamGenerateContent"));
        let response = post_json(PROVIDER, &self.client, &url, &headers, &request).await?;

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
                    let Ok(event) = serde_json::from_str::<GeminiResponse>(&data) else {
                        tracing::debug!("Skipping unrecognised stream chunk: {}", data);
                        continue;
                    };
                    for out in state.apply(event) {
                        if tx.send(out).await.is_err() {
                            return;
                        }
                    }
                }
            }

            // Gemini has no terminal sentinel; the stream simply ends
            let _ = tx.send(StreamEvent::Done(state.finish())).await;
        });

        Ok(rx)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    text: String,
    tool_calls: Vec<ContentBlock>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

impl StreamState {
    fn apply(&mut self, response: GeminiResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(u) = response.usage_metadata {
            self.usage = TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            };
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return events;
        };
        if let Some(reason) = candidate.finish_reason {
            self.finish_reason = Some(reason);
        }

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    self.text.push_str(&text);
                    events.push(StreamEvent::TextDelta(text));
                }
            }
            if let Some(call) = part.function_call {
                // Gemini calls carry no id; synthesize a stable one per response
                let id = format!("{}-{}", call.name, self.tool_calls.len());
                let args = call.args.unwrap_or_else(|| serde_json::json!({}));
                events.push(StreamEvent::ToolUseStart {
                    id: id.clone(),
                    name: call.name.clone(),
                });
                events.push(StreamEvent::ToolUseInputDelta(args.to_string()));
                self.tool_calls.push(ContentBlock::ToolUse {
                    id,
                    name: call.name,
                    input: args,
                });
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
        content.append(&mut self.tool_calls);
        LlmResponse {
            message: Message::assistant(content),
            usage: self.usage.clone(),
            stop_reason: self.finish_reason.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    text: Option<String>,
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
    #[serde(default)]
    total_token_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_response_uses_call_name() {
        let messages = vec![
            Message::user("read it"),
            Message::assistant(vec![ContentBlock::ToolUse {
                id: "read_file-0".to_string(),
                name: "read_file".to_string(),
                input: serde_json::json!({"path": "a.txt"}),
            }]),
            Message::tool_result("read_file-0", "hello", false),
        ];

        let contents = GoogleClient::convert_messages(&messages);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "read_file");
        let response = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "read_file");
        assert_eq!(response["response"]["output"], "hello");
    }

    #[test]
    fn test_build_request_system_and_tools() {
        let client = GoogleClient::new("k".to_string(), "gemini-test".to_string());
        let tools = vec![ToolDefinition {
            name: "list_directory".to_string(),
            description: "List".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let request = client.build_request(&[Message::user("hi")], Some("be brief"), &tools);
        assert_eq!(request["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(
            request["tools"][0]["functionDeclarations"][0]["name"],
            "list_directory"
        );
        assert_eq!(request["generationConfig"]["maxOutputTokens"], 4096);
        assert!(client
            .url("generateContent")
            .ends_with("/v1beta/models/gemini-test:generateContent"));
    }

    #[test]
    fn test_stream_state_collects_calls_and_usage() {
        let mut state = StreamState::default();
        let chunk: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"ok "},{"functionCall":{"name":"read_file","args":{"path":"a"}}}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":2,"totalTokenCount":7}}"#,
        )
        .unwrap();
        let events = state.apply(chunk);
        assert!(matches!(events[0], StreamEvent::TextDelta(_)));

        let response = state.finish();
        assert_eq!(response.text(), "ok ");
        let calls = response.tool_calls();
        assert_eq!(calls[0].id, "read_file-0");
        assert_eq!(calls[0].args["path"], "a");
        assert_eq!(response.usage.total_tokens, 7);
        assert_eq!(response.stop_reason.as_deref(), Some("STOP"));
    }
}
