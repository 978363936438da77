//! Web search backend and the travel search tools

use super::Tool;
use crate::error::OrchestrationError;
use crate::models::{ParamType, ToolSchema};
use crate::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_SEARCH_URL: &str = "https://api.duckduckgo.com/";
const GUIDE_MAX_CHARS: usize = 2000;

#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<String>;
}

/// Instant-answer style web search (`?q=...&format=json`).
pub struct WebSearch {
    client: Client,
    base_url: String,
}

impl WebSearch {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    abstract_text: String,
    #[serde(default)]
    answer: Value,
    #[serde(default)]
    related_topics: Vec<Topic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Topic {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    topics: Vec<Topic>,
}

impl InstantAnswer {
    fn snippets(&self) -> Vec<String> {
        fn collect(topics: &[Topic], out: &mut Vec<String>) {
            for topic in topics {
                if let Some(text) = topic.text.as_deref().filter(|t| !t.is_empty()) {
                    out.push(text.to_string());
                }
                collect(&topic.topics, out);
            }
        }

        let mut out = Vec::new();
        if let Some(answer) = self.answer.as_str().filter(|a| !a.is_empty()) {
            out.push(answer.to_string());
        }
        if !self.abstract_text.is_empty() {
            out.push(self.abstract_text.clone());
        }
        collect(&self.related_topics, &mut out);
        out
    }
}

#[async_trait::async_trait]
impl SearchBackend for WebSearch {
    async fn search(&self, query: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|e| OrchestrationError::Capability(format!("Search request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::Capability(format!(
                "Search API returned {}",
                status
            )));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| OrchestrationError::Capability(format!("Invalid search response: {}", e)))?;

        let snippets = answer.snippets();
        if snippets.is_empty() {
            return Ok(format!("No results found for '{}'", query));
        }
        Ok(snippets.join("\n"))
    }
}

/// Returns the same text for every query and records the queries.
pub struct CannedSearch {
    text: String,
    queries: std::sync::Mutex<Vec<String>>,
}

impl CannedSearch {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            queries: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SearchBackend for CannedSearch {
    async fn search(&self, query: &str) -> Result<String> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        Ok(self.text.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchKind {
    Flights,
    Hotels,
    Guide,
}

/// A search tool that turns its arguments into one web query.
pub struct SearchTool {
    kind: SearchKind,
    schema: ToolSchema,
    backend: Arc<dyn SearchBackend>,
}

impl SearchTool {
    pub fn flights(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            kind: SearchKind::Flights,
            schema: ToolSchema::new(
                "search_flights",
                "Search for real-time flight ticket prices using the internet.",
            )
            .param("origin", ParamType::String, "Departure city (e.g., Kuala Lumpur)")
            .param("destination", ParamType::String, "Destination city (e.g., Tokyo)")
            .param("date", ParamType::String, "Travel date (e.g., Next Month)"),
            backend,
        }
    }

    pub fn hotels(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            kind: SearchKind::Hotels,
            schema: ToolSchema::new(
                "search_hotels",
                "Search for real-time hotel prices using the internet.",
            )
            .param("city", ParamType::String, "Destination city")
            .param("check_in", ParamType::String, "Check-in date"),
            backend,
        }
    }

    pub fn guide(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            kind: SearchKind::Guide,
            schema: ToolSchema::new(
                "get_travel_guide",
                "Search for travel guides, attractions, and food.",
            )
            .param("city", ParamType::String, "City to research"),
            backend,
        }
    }

    fn query(&self, arguments: &Value) -> String {
        let arg = |name: &str| arguments.get(name).and_then(Value::as_str).unwrap_or_default();
        match self.kind {
            SearchKind::Flights => format!(
                "cheap flight ticket price from {} to {} on {} skyscanner trip.com",
                arg("origin"),
                arg("destination"),
                arg("date")
            ),
            SearchKind::Hotels => format!(
                "budget hotel prices in {} on {} booking.com agoda",
                arg("city"),
                arg("check_in")
            ),
            SearchKind::Guide => format!(
                "{} travel guide must visit places best food 3 days itinerary",
                arg("city")
            ),
        }
    }
}

#[async_trait::async_trait]
impl Tool for SearchTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let query = self.query(arguments);
        info!(tool = %self.schema.name, %query, "Searching the web");

        let result = self.backend.search(&query).await?;
        if self.kind == SearchKind::Guide {
            return Ok(truncate_chars(&result, GUIDE_MAX_CHARS));
        }
        Ok(result)
    }
}

/// Keep the first `max` characters, marking the cut.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...(content truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_flight_query_format() {
        let backend = Arc::new(CannedSearch::new("RM 1,200 return"));
        let tool = SearchTool::flights(backend.clone());

        let result = tool
            .execute(&json!({"origin": "Kuala Lumpur", "destination": "Tokyo", "date": "May"}))
            .await
            .unwrap();

        assert_eq!(result, "RM 1,200 return");
        assert_eq!(
            backend.queries(),
            vec!["cheap flight ticket price from Kuala Lumpur to Tokyo on May skyscanner trip.com"]
        );
    }

    #[tokio::test]
    async fn test_guide_is_truncated() {
        let backend = Arc::new(CannedSearch::new("é".repeat(2500)));
        let tool = SearchTool::guide(backend);

        let result = tool.execute(&json!({"city": "Tokyo"})).await.unwrap();
        assert!(result.ends_with("...(content truncated)"));
        assert_eq!(result.chars().filter(|c| *c == 'é').count(), 2000);
    }

    #[test]
    fn test_instant_answer_snippets() {
        let raw = json!({
            "AbstractText": "Tokyo is the capital of Japan.",
            "Answer": "",
            "RelatedTopics": [
                {"Text": "Shinjuku - district"},
                {"Name": "Food", "Topics": [{"Text": "Ramen"}]}
            ]
        });
        let answer: InstantAnswer = serde_json::from_value(raw).unwrap();
        assert_eq!(
            answer.snippets(),
            vec!["Tokyo is the capital of Japan.", "Shinjuku - district", "Ramen"]
        );
    }
}
