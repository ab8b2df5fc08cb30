//! Voice agent profiles
//!
//! An agent decides what the remote model is told (system instruction and
//! opening line), which prebuilt voice it speaks with, and how the resulting
//! call record is labelled.

use serde::{Deserialize, Serialize};

/// Voice used when no agent is selected
pub const DEFAULT_VOICE: &str = "Kore";

/// Participant label for sessions started without an agent
pub const DEMO_PARTICIPANT: &str = "Demo User";

/// Agent reference for sessions started without an agent
pub const DEMO_AGENT_REFERENCE: &str = "demo_agent";

/// System instruction used when no agent (or an agent without instructions) is selected
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a professional yet friendly AI Voice Agent for Kredmint.ai.
Your role is to help Indian business owners with financial products like Distribution Finance and Invoice Discounting.

CRITICAL VOICE INSTRUCTIONS:
1. SPEAK NATURALLY: Do not read bullet points, numbers, or markdown symbols. Talk like a human.
2. HINGLISH IS MANDATORY: Use a natural mix of Hindi and English. Example: "Invoice Discounting mein payment 24 hours mein mil jaata hai."
3. BE CONCISE: Speak in short bursts (1-2 sentences). Wait for the user to ask more. Do not monologue.
4. NO ROBOTIC FILLERS: Avoid "I understand," "Thank you for that information." Instead use "Okay," "Samjha," "Right."

IDENTITY:
- You are helpful, respectful, and sharp.
- You represent Kredmint.

PRODUCTS (Explain simply):
- Distribution Finance: Stock khareedne ke liye credit. Eligibility: 1 saal purana business.
- Invoice Discounting: Bill ke against advance payment. 24-72 ghante mein paisa.
- Term Loans: Business badhane ke liye loan (6-36 mahine).

HANDLING QUESTIONS:
- If asked about rates: "Rates profile pe depend karte hain, par competitive hain."
- If asked about process: "Bas app download karke docs upload kijiye."
- If stuck: "Ek second, let me check." (Act like you are thinking).

GOAL:
Get the user interested and guide them to the Kredmint App or ask for their specific requirement.
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
}

/// A configured voice agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Product-level voice id (`female_1`, `male_1`, ...)
    pub voice_id: String,
    /// Line the agent must open the conversation with (may be empty)
    #[serde(default)]
    pub initial_message: String,
    /// System instruction (empty means the default prompt)
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub status: AgentStatus,
}

/// Map a product voice id to the provider's prebuilt voice name
pub fn provider_voice(voice_id: &str) -> &'static str {
    match voice_id {
        "female_1" => "Aoede",
        "female_2" => "Fenrir",
        "male_1" => "Charon",
        _ => "Puck",
    }
}

/// Everything a session needs to know about who it is talking as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub system_instruction: String,
    pub voice_name: String,
    pub participant_label: String,
    pub agent_reference: String,
}

impl SessionProfile {
    pub fn for_agent(agent: Option<&Agent>) -> Self {
        let Some(agent) = agent else {
            return Self {
                system_instruction: DEFAULT_SYSTEM_PROMPT.to_string(),
                voice_name: DEFAULT_VOICE.to_string(),
                participant_label: DEMO_PARTICIPANT.to_string(),
                agent_reference: DEMO_AGENT_REFERENCE.to_string(),
            };
        };

        let mut system_instruction = if agent.instructions.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            agent.instructions.clone()
        };

        if !agent.initial_message.trim().is_empty() {
            system_instruction.push_str(&format!(
                "\n\nIMPORTANT: Start the conversation by saying exactly this: \"{}\"",
                agent.initial_message.trim()
            ));
        }

        Self {
            system_instruction,
            voice_name: provider_voice(&agent.voice_id).to_string(),
            participant_label: format!("Tester (Agent: {})", agent.name),
            agent_reference: agent.id.clone(),
        }
    }
}
