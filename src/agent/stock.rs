//! Stock-quote agent: a tool loop around `get_stock_price`

use super::ToolLoop;
use crate::capability::CapabilityConfig;
use crate::graph::CompiledGraph;
use crate::model::ModelCapability;
use crate::tools::market::{QuoteSource, StockPriceTool};
use crate::tools::ToolRegistry;
use crate::Result;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are a market assistant. When the user asks about a stock price, \
call get_stock_price with the upper-case ticker symbol, then answer using the tool result. \
If the tool reports an error, explain it briefly.";

/// Compile the stock agent. `quotes` is `None` when market-data credentials
/// are missing; the tool then reports the problem to the model.
pub fn build_stock_agent(
    model: Arc<dyn ModelCapability>,
    quotes: Option<Arc<dyn QuoteSource>>,
    capability: CapabilityConfig,
) -> Result<CompiledGraph> {
    let registry = ToolRegistry::new().with(StockPriceTool::new(quotes))?;

    ToolLoop::new(model, Arc::new(registry))
        .named("stock_agent")
        .with_system_prompt(SYSTEM_PROMPT)
        .recover_tool_errors(true)
        .with_capability_config(capability)
        .compile()
}
