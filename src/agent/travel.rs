//! Travel planner: manager → {flight, hotel, guide} → reporter
//!
//! The manager extracts the trip from the request, three research agents run
//! as one fan-out step and the reporter joins their findings into a plan.

use super::{call_single_tool, Failsafe, WARNINGS};
use crate::capability::CapabilityConfig;
use crate::error::OrchestrationError;
use crate::graph::{CompiledGraph, Node, NodeContext, StateGraph, END, START};
use crate::model::{call_model, ModelCapability};
use crate::models::{Message, ToolCall};
use crate::state::{FieldSpec, FieldType, State, StateSchema, StateUpdate};
use crate::tools::search::{SearchBackend, SearchTool};
use crate::tools::ToolRegistry;
use crate::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const REQUEST: &str = "request";
pub const ORIGIN: &str = "origin";
pub const DESTINATION: &str = "destination";
pub const DATE: &str = "date";
pub const FLIGHT_INFO: &str = "flight_info";
pub const HOTEL_INFO: &str = "hotel_info";
pub const GUIDE_INFO: &str = "guide_info";
pub const FINAL_PLAN: &str = "final_plan";

pub const DEFAULT_ORIGIN: &str = "Kuala Lumpur";
pub const DEFAULT_DESTINATION: &str = "Tokyo";
pub const DEFAULT_DATE: &str = "Next Month";

/// Trip details extracted by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trip {
    pub origin: String,
    pub destination: String,
    pub date: String,
}

#[derive(Debug, Deserialize)]
struct RawTrip {
    origin: Option<String>,
    destination: Option<String>,
    date: Option<String>,
}

/// Parse the manager's JSON reply.
///
/// Markdown fences are stripped and, failing a direct parse, the outermost
/// `{...}` block is tried. Missing origin and date take their defaults; a
/// missing destination is an error.
pub fn parse_trip(raw: &str) -> Result<Trip> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();

    let parsed: RawTrip = match serde_json::from_str(cleaned) {
        Ok(parsed) => parsed,
        Err(first) => {
            let block = match (cleaned.find('{'), cleaned.rfind('}')) {
                (Some(start), Some(end)) if start < end => &cleaned[start..=end],
                _ => return Err(first.into()),
            };
            serde_json::from_str(block)?
        }
    };

    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    let destination = non_empty(parsed.destination).ok_or_else(|| {
        OrchestrationError::InvalidUpdate {
            field: DESTINATION.to_string(),
            reason: "manager reply has no destination".to_string(),
        }
    })?;

    Ok(Trip {
        origin: non_empty(parsed.origin).unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
        destination,
        date: non_empty(parsed.date).unwrap_or_else(|| DEFAULT_DATE.to_string()),
    })
}

fn text_field<'a>(state: &'a State, field: &str) -> Result<&'a str> {
    state
        .get_str(field)
        .ok_or_else(|| OrchestrationError::Schema(format!("field '{}' has no value", field)))
}

struct ManagerNode {
    model: Arc<dyn ModelCapability>,
    capability: CapabilityConfig,
}

#[async_trait::async_trait]
impl Node for ManagerNode {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        let request = text_field(state, REQUEST)?;
        let prompt = format!(
            "User Request: \"{}\"\n\n\
             Please extract the following information and return it in JSON format:\n\
             1. origin (Departure city. If not specified, default to '{}')\n\
             2. destination (Target city)\n\
             3. date (Travel date. If not specified, default to '{}')\n\n\
             Return ONLY JSON. Do not include Markdown formatting like ```json.",
            request, DEFAULT_ORIGIN, DEFAULT_DATE
        );

        let response = call_model(
            self.model.as_ref(),
            &[Message::human(prompt)],
            None,
            &self.capability,
            &ctx.cancel,
        )
        .await?;

        let mut update = StateUpdate::new();
        let trip = match parse_trip(&response.content) {
            Ok(trip) => trip,
            Err(err) => {
                warn!(node = %ctx.node, error = %err, "Manager failed to parse trip, using defaults");
                update = update.push(
                    WARNINGS,
                    format!("{}: could not parse trip details ({}), using defaults", ctx.node, err),
                );
                Trip {
                    origin: DEFAULT_ORIGIN.to_string(),
                    destination: DEFAULT_DESTINATION.to_string(),
                    date: DEFAULT_DATE.to_string(),
                }
            }
        };

        info!(origin = %trip.origin, destination = %trip.destination, date = %trip.date, "Trip extracted");
        Ok(update
            .set(ORIGIN, trip.origin)
            .set(DESTINATION, trip.destination)
            .set(DATE, trip.date))
    }
}

/// Flight or hotel research: one model turn with a single search tool bound.
struct SearchAgentNode {
    model: Arc<dyn ModelCapability>,
    registry: ToolRegistry,
    failsafe: Failsafe,
    prompt: fn(&State) -> Result<String>,
    output: &'static str,
    capability: CapabilityConfig,
}

#[async_trait::async_trait]
impl Node for SearchAgentNode {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        let prompt = (self.prompt)(state)?;
        let outcome = call_single_tool(
            self.model.as_ref(),
            &self.registry,
            &prompt,
            &self.failsafe,
            state,
            &self.capability,
            &ctx.cancel,
        )
        .await?;

        let mut update = StateUpdate::new();
        if outcome.forced {
            update = update.push(
                WARNINGS,
                format!("{}: forced '{}' call", ctx.node, self.failsafe.tool()),
            );
        }

        let info = match outcome.output {
            Ok(result) => result,
            Err(err) => {
                warn!(node = %ctx.node, tool = %outcome.call.name, error = %err, "Search failed");
                format!("Search failed: {}", err)
            }
        };
        Ok(update.set(self.output, info))
    }
}

/// Guide research skips the model and searches directly.
struct GuideNode {
    registry: ToolRegistry,
    capability: CapabilityConfig,
}

#[async_trait::async_trait]
impl Node for GuideNode {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        let city = text_field(state, DESTINATION)?;
        let call = ToolCall::new("get_travel_guide", json!({ "city": city }));

        let info = match self.registry.invoke(&call, &self.capability, &ctx.cancel).await {
            Ok(result) => result,
            Err(OrchestrationError::Cancelled) => return Err(OrchestrationError::Cancelled),
            Err(err) => {
                warn!(node = %ctx.node, error = %err, "Guide search failed");
                format!("Search failed: {}", err)
            }
        };
        Ok(StateUpdate::new().set(GUIDE_INFO, info))
    }
}

struct ReporterNode {
    model: Arc<dyn ModelCapability>,
    capability: CapabilityConfig,
}

#[async_trait::async_trait]
impl Node for ReporterNode {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        let prompt = format!(
            "You are a Senior Travel Planner.\n\
             Based on the REAL search data below, write a **detailed** travel itinerary.\n\n\
             [Flight Data]: {}\n\
             [Hotel Data]: {}\n\
             [Guide Data]: {}\n\n\
             Requirements:\n\
             1. **Budget Estimation**: Calculate the total estimated cost based on the numbers found in the search results. \
             If currencies are mixed, convert them or mention them clearly.\n\
             2. **Detailed Itinerary**: Describe the trip day-by-day with morning, afternoon and evening activities \
             and food recommendations. Use the Guide Data for real attraction names.\n\
             3. **Tone**: Enthusiastic, professional, and helpful.\n\
             4. **Correction**: If the flight search results look wrong, say so and suggest checking Skyscanner manually.\n\n\
             Please write a comprehensive report (at least 600 words):",
            text_field(state, FLIGHT_INFO)?,
            text_field(state, HOTEL_INFO)?,
            text_field(state, GUIDE_INFO)?,
        );

        let response = call_model(
            self.model.as_ref(),
            &[Message::human(prompt)],
            None,
            &self.capability,
            &ctx.cancel,
        )
        .await?;

        Ok(StateUpdate::new().set(FINAL_PLAN, response.content))
    }
}

fn flight_prompt(state: &State) -> Result<String> {
    Ok(format!(
        "Find cheap flights from {} to {} on {}.",
        text_field(state, ORIGIN)?,
        text_field(state, DESTINATION)?,
        text_field(state, DATE)?
    ))
}

fn hotel_prompt(state: &State) -> Result<String> {
    Ok(format!(
        "Find cheap hotels in {} on {}.",
        text_field(state, DESTINATION)?,
        text_field(state, DATE)?
    ))
}

fn arguments_from(state: &State, mapping: &[(&str, &str)]) -> Result<Value> {
    let mut args = serde_json::Map::new();
    for (param, field) in mapping {
        args.insert(param.to_string(), Value::from(text_field(state, field)?));
    }
    Ok(Value::Object(args))
}

pub struct TravelPlanner {
    model: Arc<dyn ModelCapability>,
    search: Arc<dyn SearchBackend>,
    capability: CapabilityConfig,
}

impl TravelPlanner {
    pub fn new(model: Arc<dyn ModelCapability>, search: Arc<dyn SearchBackend>) -> Self {
        Self {
            model,
            search,
            capability: CapabilityConfig::default(),
        }
    }

    pub fn with_capability_config(mut self, config: CapabilityConfig) -> Self {
        self.capability = config;
        self
    }

    pub fn schema() -> Result<StateSchema> {
        [REQUEST, ORIGIN, DESTINATION, DATE, FLIGHT_INFO, HOTEL_INFO, GUIDE_INFO, FINAL_PLAN]
            .into_iter()
            .fold(StateSchema::builder(), |builder, name| {
                builder.field(FieldSpec::replace(name, FieldType::Text))
            })
            .field(FieldSpec::append(WARNINGS))
            .build()
    }

    /// Initial state for a planning request.
    pub fn input(request: impl Into<String>) -> StateUpdate {
        StateUpdate::new().set(REQUEST, request.into())
    }

    pub fn compile(self) -> Result<CompiledGraph> {
        let flights = ToolRegistry::new().with(SearchTool::flights(Arc::clone(&self.search)))?;
        let hotels = ToolRegistry::new().with(SearchTool::hotels(Arc::clone(&self.search)))?;
        let guide = ToolRegistry::new().with(SearchTool::guide(Arc::clone(&self.search)))?;

        let mut graph = StateGraph::new("travel_planner", Self::schema()?);
        graph
            .add_node(
                "manager",
                ManagerNode {
                    model: Arc::clone(&self.model),
                    capability: self.capability,
                },
            )
            .add_node(
                "flight_agent",
                SearchAgentNode {
                    model: Arc::clone(&self.model),
                    registry: flights,
                    failsafe: Failsafe::new("search_flights", |state: &State| {
                        arguments_from(
                            state,
                            &[("origin", ORIGIN), ("destination", DESTINATION), ("date", DATE)],
                        )
                    }),
                    prompt: flight_prompt,
                    output: FLIGHT_INFO,
                    capability: self.capability,
                },
            )
            .add_node(
                "hotel_agent",
                SearchAgentNode {
                    model: Arc::clone(&self.model),
                    registry: hotels,
                    failsafe: Failsafe::new("search_hotels", |state: &State| {
                        arguments_from(state, &[("city", DESTINATION), ("check_in", DATE)])
                    }),
                    prompt: hotel_prompt,
                    output: HOTEL_INFO,
                    capability: self.capability,
                },
            )
            .add_node(
                "guide_agent",
                GuideNode {
                    registry: guide,
                    capability: self.capability,
                },
            )
            .add_node(
                "reporter",
                ReporterNode {
                    model: Arc::clone(&self.model),
                    capability: self.capability,
                },
            )
            .add_edge(START, "manager")
            .add_edge("manager", "flight_agent")
            .add_edge("manager", "hotel_agent")
            .add_edge("manager", "guide_agent")
            .add_edge("flight_agent", "reporter")
            .add_edge("hotel_agent", "reporter")
            .add_edge("guide_agent", "reporter")
            .add_edge("reporter", END);

        Ok(graph.compile()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RunConfig;
    use crate::model::ScriptedModel;
    use crate::models::{ModelResponse, ToolSchema};
    use crate::tools::search::CannedSearch;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers by prompt content so concurrent agents get stable replies.
    struct PromptModel {
        manager_reply: String,
        flight_uses_tool: bool,
        reports: AtomicUsize,
    }

    impl PromptModel {
        fn new(manager_reply: &str, flight_uses_tool: bool) -> Self {
            Self {
                manager_reply: manager_reply.to_string(),
                flight_uses_tool,
                reports: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelCapability for PromptModel {
        fn name(&self) -> &str {
            "prompt-model"
        }

        async fn invoke(
            &self,
            conversation: &[Message],
            _tools: Option<&[ToolSchema]>,
        ) -> Result<ModelResponse> {
            let prompt = conversation.last().map(|m| m.content()).unwrap_or_default();
            if prompt.starts_with("User Request") {
                Ok(ModelResponse::text(self.manager_reply.clone()))
            } else if prompt.starts_with("Find cheap flights") && self.flight_uses_tool {
                Ok(ModelResponse::text("").with_tool_call(
                    "search_flights",
                    json!({"origin": "Penang", "destination": "Osaka", "date": "June"}),
                ))
            } else if prompt.starts_with("You are a Senior Travel Planner") {
                self.reports.fetch_add(1, Ordering::SeqCst);
                Ok(ModelResponse::text("Day 1: arrive."))
            } else {
                Ok(ModelResponse::text("I would search for that."))
            }
        }
    }

    struct FailingSearch;

    #[async_trait::async_trait]
    impl SearchBackend for FailingSearch {
        async fn search(&self, _query: &str) -> Result<String> {
            Err(OrchestrationError::Capability("rate limited".to_string()))
        }
    }

    fn warnings(state: &State) -> Vec<String> {
        state.get_as(WARNINGS).unwrap()
    }

    #[test]
    fn test_parse_trip_defaults_and_fences() {
        let trip = parse_trip("```json\n{\"destination\": \"Osaka\"}\n```").unwrap();
        assert_eq!(
            trip,
            Trip {
                origin: DEFAULT_ORIGIN.to_string(),
                destination: "Osaka".to_string(),
                date: DEFAULT_DATE.to_string(),
            }
        );

        let embedded = parse_trip("Sure! {\"origin\": \"Penang\", \"destination\": \"Seoul\", \"date\": \"May\"}").unwrap();
        assert_eq!(embedded.origin, "Penang");

        assert!(parse_trip("no idea").is_err());
        assert!(parse_trip("{\"origin\": \"Penang\"}").is_err());
    }

    #[tokio::test]
    async fn test_plan_fans_out_and_joins_once() {
        let model = Arc::new(PromptModel::new(
            r#"{"origin": "Penang", "destination": "Osaka", "date": "June"}"#,
            true,
        ));
        let search = Arc::new(CannedSearch::new("found it"));

        let graph = TravelPlanner::new(model.clone(), search.clone()).compile().unwrap();
        assert!(graph.is_join("reporter"));

        let state = graph
            .invoke(TravelPlanner::input("Trip from Penang to Osaka in June"))
            .await
            .unwrap();

        assert_eq!(state.get_str(DESTINATION), Some("Osaka"));
        assert_eq!(state.get_str(FLIGHT_INFO), Some("found it"));
        assert_eq!(state.get_str(HOTEL_INFO), Some("found it"));
        assert_eq!(state.get_str(FINAL_PLAN), Some("Day 1: arrive."));
        assert_eq!(model.reports.load(Ordering::SeqCst), 1);

        // Hotel agent answered in prose, so its search was forced.
        assert_eq!(warnings(&state), vec!["hotel_agent: forced 'search_hotels' call"]);
        assert!(search
            .queries()
            .contains(&"budget hotel prices in Osaka on June booking.com agoda".to_string()));
    }

    #[tokio::test]
    async fn test_steps_follow_graph_shape() {
        let model = Arc::new(PromptModel::new(r#"{"destination": "Osaka"}"#, true));
        let graph = TravelPlanner::new(model, Arc::new(CannedSearch::new("ok")))
            .compile()
            .unwrap();

        let steps: Vec<Vec<String>> = graph
            .stream_with(TravelPlanner::input("Osaka please"), RunConfig::default())
            .map(|step| step.unwrap().nodes)
            .collect()
            .await;

        assert_eq!(
            steps,
            vec![
                vec!["manager".to_string()],
                vec![
                    "flight_agent".to_string(),
                    "hotel_agent".to_string(),
                    "guide_agent".to_string()
                ],
                vec!["reporter".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_manager_fallback_is_recorded() {
        let model = Arc::new(PromptModel::new("I am not JSON", false));
        let graph = TravelPlanner::new(model, Arc::new(CannedSearch::new("ok")))
            .compile()
            .unwrap();

        let state = graph.invoke(TravelPlanner::input("somewhere nice")).await.unwrap();

        assert_eq!(state.get_str(ORIGIN), Some(DEFAULT_ORIGIN));
        assert_eq!(state.get_str(DESTINATION), Some(DEFAULT_DESTINATION));
        assert_eq!(state.get_str(DATE), Some(DEFAULT_DATE));

        let warnings = warnings(&state);
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].starts_with("manager: could not parse trip details"));
        assert!(warnings.contains(&"flight_agent: forced 'search_flights' call".to_string()));
    }

    #[tokio::test]
    async fn test_search_failures_become_info_text() {
        let model = Arc::new(PromptModel::new(r#"{"destination": "Osaka"}"#, true));
        let graph = TravelPlanner::new(model, Arc::new(FailingSearch))
            .compile()
            .unwrap();

        let state = graph.invoke(TravelPlanner::input("Osaka")).await.unwrap();

        for field in [FLIGHT_INFO, HOTEL_INFO, GUIDE_INFO] {
            let info = state.get_str(field).unwrap();
            assert!(info.starts_with("Search failed:"), "{field}: {info}");
            assert!(info.contains("rate limited"));
        }
        assert!(state.get_str(FINAL_PLAN).is_some());
    }

    #[tokio::test]
    async fn test_scripted_offline_run_completes() {
        let model = Arc::new(ScriptedModel::new(vec![
            ModelResponse::text(r#"{"origin": "Kuala Lumpur", "destination": "Tokyo", "date": "May"}"#),
            ModelResponse::text("searching"),
            ModelResponse::text("searching"),
            ModelResponse::text("Tokyo plan"),
        ]));

        let graph = TravelPlanner::new(model, Arc::new(CannedSearch::new("cheap")))
            .compile()
            .unwrap();
        let state = graph.invoke(TravelPlanner::input("Tokyo in May")).await.unwrap();

        assert_eq!(state.get_str(FINAL_PLAN), Some("Tokyo plan"));
        assert_eq!(warnings(&state).len(), 2);
    }
}
