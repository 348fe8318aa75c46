use anyhow::{Context as _, Result};
use serde::Serialize;
use switchboard_core::{ChatTurn, TenantConfig};
use tera::{Context, Tera};

const INSTRUCTION_TEMPLATE_NAME: &str = "instruction";

const INSTRUCTION_TEMPLATE: &str = r#"{{ system_prompt }}
{% if role %}
Role: {{ role }}{% endif %}
Portal: {{ domain }}
{% if history %}
Recent conversation (oldest first):
{% for turn in history %}{{ turn.role }}: {{ turn.content }}
{% endfor %}{% endif %}"#;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant for the CRM portal. Answer briefly and ask when details are missing.";

#[derive(Serialize)]
struct TemplateTurn<'a> {
    role: &'static str,
    content: &'a str,
}

/// Renders the agent instruction from tenant config and seeded history.
#[derive(Clone, Debug)]
pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        Self::with_template(INSTRUCTION_TEMPLATE)
    }

    pub fn with_template(template: &str) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(INSTRUCTION_TEMPLATE_NAME, template)
            .context("instruction template failed to parse")?;
        Ok(Self { tera })
    }

    pub fn render_instruction(&self, config: &TenantConfig, history: &[ChatTurn]) -> Result<String> {
        let turns: Vec<TemplateTurn<'_>> = history
            .iter()
            .map(|turn| TemplateTurn { role: turn.role.as_str(), content: &turn.content })
            .collect();

        let mut context = Context::new();
        context.insert("system_prompt", config.system_prompt().unwrap_or(DEFAULT_SYSTEM_PROMPT));
        context.insert("role", &config.role());
        context.insert("domain", &config.domain);
        context.insert("history", &turns);

        let rendered = self
            .tera
            .render(INSTRUCTION_TEMPLATE_NAME, &context)
            .context("instruction template failed to render")?;
        Ok(rendered.trim().to_string())
    }
}
