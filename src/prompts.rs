//! Prompt templates for the social-preference choice task.
//!
//! The model plays Person B and picks Left or Right; the template carries the
//! persona, the tier, both payoff pairs and the metric to focus on.

use serde::{Deserialize, Serialize};

use crate::gateway::Message;

/// Fields interpolated into a template for one request unit.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptFields {
    pub persona_desc: String,
    pub difficulty: String,
    pub a_left: String,
    pub b_left: String,
    pub a_right: String,
    pub b_right: String,
    pub metric: String,
}

/// Rendered prompt ready for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, fields: &PromptFields) -> PromptInstance {
        // An empty description is the no-persona baseline and renders as-is.
        let persona = fields.persona_desc.trim();
        let fill = |text: &str| {
            text.replace("{difficulty}", &fields.difficulty)
                .replace("{A_left}", &fields.a_left)
                .replace("{B_left}", &fields.b_left)
                .replace("{A_right}", &fields.a_right)
                .replace("{B_right}", &fields.b_right)
                .replace("{metric}", &fields.metric)
                .replace("{persona_desc}", persona)
        };

        PromptInstance {
            template_slug: self.slug,
            system: fill(self.system).trim().to_string(),
            user: fill(self.user).trim().to_string(),
        }
    }
}

/// Prompt language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Kr,
}

impl Language {
    pub fn template(self) -> PromptTemplate {
        match self {
            Language::En => PROMPT_EN,
            Language::Kr => PROMPT_KR,
        }
    }
}

pub const PROMPT_EN: PromptTemplate = PromptTemplate {
    slug: "social_pref_en_v1",
    system: r#"You are **Person B** in a **{difficulty}-level** Social Preferences Experiment.
Answer in the voice of the persona you are given and weigh the trade-off between the two options.

Return **JSON only**:
{
  "reasoning": "<concise reason>",
  "choice": "Left" | "Right"
}"#,
    user: r#"**Persona**
{persona_desc}

**Choices**
- **Left** : Person B {B_left}, Person A {A_left}
- **Right**: Person B {B_right}, Person A {A_right}

Focus on **{metric}**."#,
};

pub const PROMPT_KR: PromptTemplate = PromptTemplate {
    slug: "social_pref_kr_v1",
    system: r#"당신은 **{difficulty} 난이도** 사회적 선호 실험에서 **B 참가자**입니다.
주어진 페르소나의 관점에서 두 선택지의 장단점을 따져 보세요.

아래 JSON 형식만 반환하세요:
{
  "reasoning": "<한두 문장으로 선택 이유>",
  "choice": "Left" | "Right"
}"#,
    user: r#"**페르소나**
{persona_desc}

**선택지**
- **왼쪽** : B 참가자 {B_left}, A 참가자 {A_left}
- **오른쪽**: B 참가자 {B_right}, A 참가자 {A_right}

이 질문은 **{metric}**에 관한 것입니다."#,
};

pub const PROMPTS: &[PromptTemplate] = &[PROMPT_EN, PROMPT_KR];

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}
