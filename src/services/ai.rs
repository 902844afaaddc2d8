use anyhow::{anyhow, Result};
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageContent,
    CreateChatCompletionRequestArgs, Role,
};
use async_openai::{config::OpenAIConfig, Client};
use tokio::time::{sleep, Duration};

/// Schema section of the SQL system prompt. Must stay in sync with the
/// dashboard_metrics migration.
const METRICS_SCHEMA: &str = r#"The schema of dashboard_metrics is:

- app TEXT
- metric_date DATE
- course_id TEXT
- course_name TEXT
- section TEXT
- primary_teacher_email TEXT
- total_students BIGINT
- total_submissions BIGINT
- turned_in_submissions BIGINT
- returned_submissions BIGINT
- late_submissions BIGINT
- avg_grade DOUBLE PRECISION
- max_grade DOUBLE PRECISION
- ingestion_time TIMESTAMPTZ"#;

#[derive(Clone)]
pub struct AiService {
    client: Client<OpenAIConfig>,
    model: String,
}

impl AiService {
    pub fn new(api_key: String, model: String) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        let client = Client::with_config(config);
        Self { client, model }
    }

    /// Translates a free-text question into one SELECT over
    /// dashboard_metrics. Retries transient API failures with backoff;
    /// the returned text still has to pass the SQL guard before it runs.
    pub async fn generate_sql(&self, app: &str, question: &str, max_rows: i64) -> Result<String> {
        let system_prompt = format!(
            r#"You are an expert data analyst. Generate a valid PostgreSQL query for the dashboard_metrics table.

{METRICS_SCHEMA}

Rules:
- Only query the dashboard_metrics table.
- Always filter app = '{app}'.
- Return at most {max_rows} rows using LIMIT.
- Use standard SQL, a single SELECT statement, no comments.
- Wrap ONLY the SQL in a ```sql ... ``` block."#
        );

        let mut retries = 0;
        loop {
            let messages = vec![
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    role: Role::System,
                    content: system_prompt.clone(),
                    name: None,
                }),
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    role: Role::User,
                    content: ChatCompletionRequestUserMessageContent::Text(format!(
                        "User question:\n\"\"\"{question}\"\"\""
                    )),
                    name: None,
                }),
            ];

            let request = CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .messages(messages)
                .build()?;

            match self.client.chat().create(request).await {
                Ok(resp) => {
                    let content = resp
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .unwrap_or_default();
                    return extract_sql(&content)
                        .ok_or_else(|| anyhow!("model reply contained no SQL"));
                }
                Err(err) => {
                    retries += 1;
                    if retries > 3 {
                        return Err(anyhow!("model error: {err}"));
                    }
                    sleep(Duration::from_millis(500 * retries)).await;
                }
            }
        }
    }

    /// One-shot prompt, used by the connectivity probe endpoint.
    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                role: Role::User,
                content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
                name: None,
            },
        )];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()?;

        let resp = self.client.chat().create(request).await?;
        resp.choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("model returned no content"))
    }
}

/// Pulls the SQL out of a model reply: a ```sql fence, a plain ``` fence,
/// or a bare SELECT/WITH as fallback.
pub fn extract_sql(reply: &str) -> Option<String> {
    let trimmed = reply.trim();

    for marker in ["```sql", "```SQL", "```"] {
        if let Some(start) = trimmed.find(marker) {
            let rest = &trimmed[start + marker.len()..];
            if let Some(end) = rest.find("```") {
                let candidate = rest[..end].trim();
                if !candidate.is_empty() {
                    return Some(candidate.to_string());
                }
            }
        }
    }

    let upper = trimmed.to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        return Some(trimmed.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sql_fence() {
        let reply = "Here you go:\n```sql\nSELECT course_id FROM dashboard_metrics LIMIT 5\n```\nEnjoy.";
        assert_eq!(
            extract_sql(reply).unwrap(),
            "SELECT course_id FROM dashboard_metrics LIMIT 5"
        );
    }

    #[test]
    fn extracts_plain_fence() {
        let reply = "```\nSELECT 1 FROM dashboard_metrics\n```";
        assert_eq!(extract_sql(reply).unwrap(), "SELECT 1 FROM dashboard_metrics");
    }

    #[test]
    fn accepts_bare_select() {
        let reply = "  WITH t AS (SELECT 1) SELECT * FROM t";
        assert_eq!(extract_sql(reply).unwrap(), reply.trim());
    }

    #[test]
    fn rejects_prose() {
        assert_eq!(extract_sql("I cannot answer that."), None);
        assert_eq!(extract_sql("``` ```"), None);
    }
}
