use anyhow::Result;
use async_trait::async_trait;
use switchboard_core::{ChatTurn, TurnRole};

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub instruction: String,
    pub transcript: Vec<ChatTurn>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn last_user_message(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|turn| turn.role == TurnRole::User)
            .map(|turn| turn.content.as_str())
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Offline client that answers with the latest user message.
#[derive(Clone, Debug, Default)]
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        Ok(request.last_user_message().map(|message| format!("echo: {message}")).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use switchboard_core::ChatTurn;

    use super::{CompletionRequest, EchoLlmClient, LlmClient};

    #[tokio::test]
    async fn echo_repeats_latest_user_turn() {
        let request = CompletionRequest {
            instruction: String::new(),
            transcript: vec![
                ChatTurn::user("first"),
                ChatTurn::assistant("ok"),
                ChatTurn::user("second"),
            ],
            model: None,
            temperature: None,
        };

        let reply = EchoLlmClient.complete(&request).await.expect("echo");
        assert_eq!(reply, "echo: second");
    }

    #[tokio::test]
    async fn echo_is_empty_without_user_turns() {
        let request = CompletionRequest {
            instruction: "be brief".to_string(),
            transcript: Vec::new(),
            model: None,
            temperature: None,
        };

        assert_eq!(EchoLlmClient.complete(&request).await.expect("echo"), "");
    }
}
