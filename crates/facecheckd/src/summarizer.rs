//! Language-model summarization of analysis reports.

use crate::config::LlmConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Turns a formatted analysis report into a narrative summary that ends
/// with a JSON block of diagram values.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, report_text: &str) -> Result<String>;
}

/// Summarizer backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiSummarizer {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    instructions: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OpenAiSummarizer {
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Self {
            agent: builder.build(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            instructions: instructions(&config.language),
        }
    }

    fn request_body<'a>(&'a self, report_text: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &self.instructions,
                },
                Message {
                    role: "user",
                    content: report_text,
                },
            ],
        }
    }
}

impl Summarizer for OpenAiSummarizer {
    fn summarize(&self, report_text: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.endpoint);

        let mut request = self.agent.post(&url).set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        tracing::debug!(url = %url, model = %self.model, "requesting summary");

        let response = request
            .send_json(self.request_body(report_text))
            .map_err(|e| anyhow!("summarizer request failed: {e}"))?;

        let chat: ChatResponse = response
            .into_json()
            .map_err(|e| anyhow!("failed to parse summarizer response: {e}"))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("summarizer returned no choices"))
    }
}

/// System instruction sent with every report.
fn instructions(language: &str) -> String {
    format!(
        r#"You are an experienced medical consultant. Analyze the results of an automated skin and general condition check of a person.

Analysis guidelines:

1. Overall assessment: draw a general conclusion about the person's condition from all the data and name the strong and the problem areas.

2. Fatigue, judged by dark circles:
   - light_darkcircles: mild fatigue (20-40%)
   - darkcircles: significant fatigue (50-70%)
   - healthy: no fatigue (0-10%)

3. Model specifics:
   - Treat mobilenet_general (edema/healthy) leniently, the model tends to be strict.
   - Treat mobilenet_skin (acne/freckles/healthy) somewhat leniently, moles are sometimes detected as acne.
   - Treat mobilenet_eyes_pupils and mobilenet_age as standard.

4. Recommendations: give concrete advice for improvement, preventive measures, and say when to see a specialist.

Response format: overall assessment, fatigue level in percent, detailed analysis per category, recommendations.

Finally, output these parameters for the user's condition chart as a single JSON object at the very end. Do not repeat the model confidences.
{{"tireness": <percent>, "eyes_health": <percent>, "swelling": <percent>, "eyes_darkircles": <percent>, "skin_health": <percent>, "acne": <percent>, "skin_condition": "<short description>"}}

Answer in {language} in a friendly tone."#
    )
}
