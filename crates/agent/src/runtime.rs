use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use switchboard_core::{ChatTurn, ConversationId};

use crate::agent::{AgentFactory, AgentSeed, ConversationAgent};
use crate::llm::{CompletionRequest, LlmClient};
use crate::prompt::PromptRenderer;

const MAX_TRANSCRIPT_TURNS: usize = 40;

/// Multi-turn agent keeping its transcript in memory for the session lifetime.
pub struct LlmAgent {
    conversation_id: ConversationId,
    instruction: String,
    model: Option<String>,
    temperature: Option<f64>,
    transcript: Vec<ChatTurn>,
    client: Arc<dyn LlmClient>,
}

impl LlmAgent {
    pub fn new(conversation_id: ConversationId, instruction: String, client: Arc<dyn LlmClient>) -> Self {
        Self {
            conversation_id,
            instruction,
            model: None,
            temperature: None,
            transcript: Vec::new(),
            client,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn transcript(&self) -> &[ChatTurn] {
        &self.transcript
    }

    fn trim_transcript(&mut self) {
        if self.transcript.len() > MAX_TRANSCRIPT_TURNS {
            let excess = self.transcript.len() - MAX_TRANSCRIPT_TURNS;
            self.transcript.drain(..excess);
        }
    }
}

#[async_trait]
impl ConversationAgent for LlmAgent {
    async fn respond(&mut self, message: &str) -> Result<String> {
        self.transcript.push(ChatTurn::user(message));
        let request = CompletionRequest {
            instruction: self.instruction.clone(),
            transcript: self.transcript.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
        };

        match self.client.complete(&request).await {
            Ok(reply) => {
                self.transcript.push(ChatTurn::assistant(reply.clone()));
                self.trim_transcript();
                Ok(reply)
            }
            Err(error) => {
                self.transcript.pop();
                Err(error)
            }
        }
    }

    async fn close(&mut self) {
        self.transcript.clear();
    }
}

pub struct LlmAgentFactory {
    client: Arc<dyn LlmClient>,
    renderer: PromptRenderer,
}

impl LlmAgentFactory {
    pub fn new(client: Arc<dyn LlmClient>, renderer: PromptRenderer) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl AgentFactory for LlmAgentFactory {
    async fn build(&self, seed: AgentSeed) -> Result<Box<dyn ConversationAgent>> {
        let instruction = self.renderer.render_instruction(&seed.config, &seed.history)?;
        let mut agent = LlmAgent::new(seed.conversation_id, instruction, Arc::clone(&self.client));
        agent.model = seed.config.model().map(str::to_string);
        agent.temperature = seed.config.temperature();
        Ok(Box::new(agent))
    }
}
