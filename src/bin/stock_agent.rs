use agent_graph_orchestrator::{
    agent::{self, stock::build_stock_agent, MESSAGES},
    config::AppConfig,
    model::{gemini::GeminiModel, ModelCapability, ScriptedModel},
    models::{Message, ModelResponse},
    tools::market::{AlpacaQuoteSource, QuoteSource, StaticQuoteSource},
    OrchestrationError,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

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
    let question = if words.is_empty() {
        "What is the current price of NVDA?".to_string()
    } else {
        words.join(" ")
    };

    let config = AppConfig::from_env()?;

    let (model, quotes): (Arc<dyn ModelCapability>, Option<Arc<dyn QuoteSource>>) = if offline {
        info!("Running offline with a scripted model and fixed quotes");
        let model = ScriptedModel::new(vec![
            ModelResponse::text("").with_tool_call("get_stock_price", json!({"symbol": "NVDA"})),
            ModelResponse::text("Here is the latest NVDA quote from the offline price table."),
        ])
        .named("offline");
        let model: Arc<dyn ModelCapability> = Arc::new(model);
        let quotes: Arc<dyn QuoteSource> = Arc::new(StaticQuoteSource::new().with_price("NVDA", 120.5));
        (model, Some(quotes))
    } else {
        let api_key = config.gemini_api_key.clone().ok_or_else(|| {
            OrchestrationError::Config("GEMINI_API_KEY not set (use --offline to try without it)".to_string())
        })?;
        let model: Arc<dyn ModelCapability> =
            Arc::new(GeminiModel::new(api_key, config.gemini_model.clone())?);

        let quotes: Option<Arc<dyn QuoteSource>> = match config.alpaca_credentials() {
            Some((key, secret)) => {
                let source: Arc<dyn QuoteSource> = Arc::new(
                    AlpacaQuoteSource::new(key, secret)?.with_base_url(config.alpaca_data_url.as_str()),
                );
                Some(source)
            }
            None => {
                warn!("ALPACA_API_KEY / ALPACA_SECRET_KEY not set, price lookups will fail");
                None
            }
        };
        (model, quotes)
    };

    let graph = build_stock_agent(model, quotes, config.capability_config())?;

    info!(question = %question, "Running stock agent");
    let state = graph
        .invoke_with(agent::input(question)?, config.run_config())
        .await?;

    let messages: Vec<Message> = state.get_as(MESSAGES)?;
    for message in messages.iter().filter(|m| matches!(m, Message::Tool { .. })) {
        println!("[tool] {}", message.content());
    }
    match agent::final_answer(&state) {
        Some(answer) => println!("{}", answer),
        None => println!("(no answer)"),
    }

    Ok(())
}
