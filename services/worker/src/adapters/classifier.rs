//! services/worker/src/adapters/classifier.rs
//!
//! This module contains the adapter for the classifying LLM.
//! It implements the `ClassificationService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use likeshelf_core::{
    domain::{Assignment, ClassifyCategory, ClassifyItem},
    ports::{ClassificationService, PortError, PortResult},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Descriptions are cut to this many characters before they are sent.
const DESCRIPTION_PREVIEW_CHARS: usize = 300;

const SYSTEM_PROMPT: &str = "You sort a user's liked videos into the user's own categories. \
You receive a JSON object with `items` (id, title, optional description and channelName) and \
`categories` (id, name). Pick the single best category for each item. If no category fits an \
item, leave that item out. Use only ids that appear in the input. Respond with a JSON object of \
the form {\"assignments\":[{\"itemId\":\"...\",\"categoryId\":\"...\"}]} and nothing else.";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `ClassificationService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiClassifierAdapter {
    client: Client<OpenAIConfig>,
    model: String,
    json_object: Regex,
}

impl OpenAiClassifierAdapter {
    /// Creates a new `OpenAiClassifierAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> PortResult<Self> {
        let json_object =
            Regex::new(r"(?s)\{.*\}").map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self {
            client,
            model,
            json_object,
        })
    }

    /// Pulls the assignments out of a reply, tolerating prose around the JSON object.
    /// Entries that are not a pair of ids are dropped; the caller validates the rest.
    fn parse_assignments(&self, content: &str) -> PortResult<Vec<Assignment>> {
        let object = self
            .json_object
            .find(content)
            .map(|m| m.as_str())
            .ok_or_else(|| PortError::Transient("classifier reply contained no JSON object".to_string()))?;

        let reply: ClassifierReply = serde_json::from_str(object)
            .map_err(|e| PortError::Transient(format!("classifier reply was not valid JSON: {}", e)))?;

        let total = reply.assignments.len();
        let assignments: Vec<Assignment> = reply
            .assignments
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<ReplyAssignment>(entry).ok())
            .map(|entry| Assignment {
                item_id: entry.item_id,
                category_id: entry.category_id,
            })
            .collect();
        if assignments.len() < total {
            debug!(
                dropped = total - assignments.len(),
                "Classifier reply contained malformed assignments"
            );
        }
        Ok(assignments)
    }
}

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Serialize)]
struct ClassifierRequest<'a> {
    items: Vec<ClassifyItem>,
    categories: &'a [ClassifyCategory],
}

#[derive(Deserialize)]
struct ClassifierReply {
    #[serde(default)]
    assignments: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyAssignment {
    item_id: Uuid,
    category_id: Uuid,
}

fn build_user_prompt(items: &[ClassifyItem], categories: &[ClassifyCategory]) -> PortResult<String> {
    let request = ClassifierRequest {
        items: items
            .iter()
            .map(|item| ClassifyItem {
                description: item
                    .description
                    .as_ref()
                    .map(|d| d.chars().take(DESCRIPTION_PREVIEW_CHARS).collect()),
                ..item.clone()
            })
            .collect(),
        categories,
    };
    serde_json::to_string(&request).map_err(|e| PortError::Unexpected(e.to_string()))
}

/// Maps client failures onto the port's retry classes.
fn openai_error(e: OpenAIError) -> PortError {
    match e {
        OpenAIError::Reqwest(inner) => PortError::Transient(inner.to_string()),
        OpenAIError::ApiError(api) if api.code.as_deref() == Some("rate_limit_exceeded") => {
            PortError::RateLimited(api.message)
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

//=========================================================================================
// `ClassificationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl ClassificationService for OpenAiClassifierAdapter {
    async fn classify(
        &self,
        items: &[ClassifyItem],
        categories: &[ClassifyCategory],
    ) -> PortResult<Vec<Assignment>> {
        if items.is_empty() || categories.is_empty() {
            return Ok(Vec::new());
        }

        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_PROMPT)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(build_user_prompt(items, categories)?)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .response_format(ResponseFormat::JsonObject)
            .temperature(0.0)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(openai_error)?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PortError::Transient("Classifier returned no choices in its response.".to_string())
            })?;

        self.parse_assignments(&content)
    }
}
