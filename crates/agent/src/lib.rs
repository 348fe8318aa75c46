//! Conversation agents driven by the coordination layer.
//!
//! The runtime owns one [`ConversationAgent`] per live session and only ever
//! calls it while holding that conversation's lock, so agents keep their
//! transcript in plain memory. Agents are built by an [`AgentFactory`] from an
//! [`AgentSeed`] carrying the merged tenant configuration and recent history.
//!
//! [`LlmAgent`] is the bundled implementation: it renders its instruction with
//! `tera` and delegates completions to an [`LlmClient`].

pub mod agent;
pub mod llm;
pub mod prompt;
pub mod runtime;

pub use agent::{AgentFactory, AgentSeed, ConversationAgent};
pub use llm::{CompletionRequest, EchoLlmClient, LlmClient};
pub use prompt::PromptRenderer;
pub use runtime::{LlmAgent, LlmAgentFactory};
