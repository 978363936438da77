use agent_graph_orchestrator::{
    agent::{
        travel::{TravelPlanner, FINAL_PLAN},
        WARNINGS,
    },
    config::AppConfig,
    model::{gemini::GeminiModel, ModelCapability, ScriptedModel},
    models::ModelResponse,
    tools::search::{CannedSearch, SearchBackend, WebSearch},
    OrchestrationError,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn offline_model() -> ScriptedModel {
    // Research agents answer in prose, so both searches go through the failsafe.
    ScriptedModel::new(vec![
        ModelResponse::text(r#"{"origin": "Kuala Lumpur", "destination": "Tokyo", "date": "Next Month"}"#),
        ModelResponse::text("I will look for options."),
        ModelResponse::text("I will look for options."),
        ModelResponse::text(
            "Day 1: Arrive in Tokyo, check in and explore Shinjuku.\n\
             Day 2: Asakusa in the morning, Ueno in the afternoon, ramen in the evening.\n\
             Day 3: Day trip to Kamakura, then fly home.",
        ),
    ])
    .named("offline")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut offline = false;
    let mut words = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--offline" {
            offline = true;
        } else {
            words.push(arg);
        }
    }
    let request = if words.is_empty() {
        "I want to go to Tokyo next month from Kuala Lumpur".to_string()
    } else {
        words.join(" ")
    };

    let config = AppConfig::from_env()?;

    let (model, search): (Arc<dyn ModelCapability>, Arc<dyn SearchBackend>) = if offline {
        info!("Running offline with a scripted model and canned search results");
        let model: Arc<dyn ModelCapability> = Arc::new(offline_model());
        let search: Arc<dyn SearchBackend> = Arc::new(CannedSearch::new(
            "Return flights from RM 1,450; capsule hotels from RM 120 per night; \
             must visit: Senso-ji, Meiji Shrine, Tsukiji Outer Market.",
        ));
        (model, search)
    } else {
        let api_key = config.gemini_api_key.clone().ok_or_else(|| {
            OrchestrationError::Config("GEMINI_API_KEY not set (use --offline to try without it)".to_string())
        })?;
        let model: Arc<dyn ModelCapability> =
            Arc::new(GeminiModel::new(api_key, config.gemini_model.clone())?);
        let search: Arc<dyn SearchBackend> = Arc::new(WebSearch::new(config.search_api_url.clone())?);
        (model, search)
    };

    let graph = TravelPlanner::new(model, search)
        .with_capability_config(config.capability_config())
        .compile()?;

    info!(request = %request, "Planning trip");
    let state = graph
        .invoke_with(TravelPlanner::input(request), config.run_config())
        .await?;

    let warnings: Vec<String> = state.get_as(WARNINGS)?;
    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }

    println!("\n=== TRAVEL PLAN ===\n");
    println!("{}", state.get_str(FINAL_PLAN).unwrap_or("(no plan produced)"));

    Ok(())
}
