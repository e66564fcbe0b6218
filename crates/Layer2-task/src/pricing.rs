//! Model pricing - cost estimates when the worker does not report one

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Model price (USD per 1M tokens)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_id: String,
    pub input_price: f64,
    pub output_price: f64,
    pub cached_price: Option<f64>,
}

impl ModelPricing {
    pub fn new(model_id: &str, input: f64, output: f64) -> Self {
        Self {
            model_id: model_id.to_string(),
            input_price: input,
            output_price: output,
            cached_price: None,
        }
    }

    pub fn with_cached(mut self, price: f64) -> Self {
        self.cached_price = Some(price);
        self
    }

    /// Cost of one call. Cached tokens are a subset of input tokens.
    pub fn calculate(&self, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64 {
        let cached_tokens = cached_tokens.min(input_tokens);
        let (fresh, cached_cost) = match self.cached_price {
            Some(price) => (
                input_tokens - cached_tokens,
                (cached_tokens as f64 / 1_000_000.0) * price,
            ),
            None => (input_tokens, 0.0),
        };
        let input_cost = (fresh as f64 / 1_000_000.0) * self.input_price;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_price;

        input_cost + output_cost + cached_cost
    }
}

/// Built-in price table for the models browser workers commonly run
pub fn default_pricing() -> &'static HashMap<String, ModelPricing> {
    static PRICING: OnceLock<HashMap<String, ModelPricing>> = OnceLock::new();
    PRICING.get_or_init(|| {
        let table = [
            // OpenAI / Azure OpenAI
            ModelPricing::new("gpt-4o", 2.5, 10.0).with_cached(1.25),
            ModelPricing::new("gpt-4o-mini", 0.15, 0.6).with_cached(0.075),
            ModelPricing::new("gpt-4.1", 2.0, 8.0).with_cached(0.5),
            ModelPricing::new("gpt-4.1-mini", 0.4, 1.6).with_cached(0.1),
            ModelPricing::new("gpt-4-turbo", 10.0, 30.0),
            ModelPricing::new("o3-mini", 1.1, 4.4),
            // Google Gemini
            ModelPricing::new("gemini-2.0-flash", 0.10, 0.40),
            ModelPricing::new("gemini-2.5-flash", 0.30, 2.50),
            ModelPricing::new("gemini-1.5-pro", 1.25, 5.0),
            ModelPricing::new("gemini-2.5-pro", 1.25, 10.0),
            // Anthropic Claude
            ModelPricing::new("claude-3.5-sonnet", 3.0, 15.0).with_cached(0.3),
            ModelPricing::new("claude-3-haiku", 0.25, 1.25).with_cached(0.03),
            // Local (free)
            ModelPricing::new("ollama", 0.0, 0.0),
        ];
        table
            .into_iter()
            .map(|p| (p.model_id.clone(), p))
            .collect()
    })
}

/// Map provider-specific model names onto price table keys
///
/// e.g. `gpt-4o-2024-08-06` -> `gpt-4o`, `models/gemini-2.0-flash-exp` -> `gemini-2.0-flash`
pub fn normalize_model_id(model: &str) -> String {
    let model = model.trim().to_lowercase();
    let model = model.rsplit('/').next().unwrap_or(&model).to_string();

    if model.contains("gpt-4o") && model.contains("mini") {
        return "gpt-4o-mini".to_string();
    }
    if model.contains("gpt-4o") {
        return "gpt-4o".to_string();
    }
    if model.contains("gpt-4.1") && model.contains("mini") {
        return "gpt-4.1-mini".to_string();
    }
    if model.contains("gpt-4.1") {
        return "gpt-4.1".to_string();
    }
    if model.contains("gemini") && model.contains("flash") {
        if model.contains("2.5") {
            return "gemini-2.5-flash".to_string();
        }
        return "gemini-2.0-flash".to_string();
    }
    if model.contains("gemini") && model.contains("pro") {
        if model.contains("2.5") {
            return "gemini-2.5-pro".to_string();
        }
        return "gemini-1.5-pro".to_string();
    }
    if model.contains("claude") && model.contains("sonnet") {
        return "claude-3.5-sonnet".to_string();
    }
    if model.contains("claude") && model.contains("haiku") {
        return "claude-3-haiku".to_string();
    }
    if model.contains("qwen") || model.contains("llama") || model.contains("mistral") {
        return "ollama".to_string();
    }

    model
}

/// Estimated cost, `None` for unknown models
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> Option<f64> {
    let pricing = default_pricing();
    pricing
        .get(&normalize_model_id(model))
        .or_else(|| pricing.get(model))
        .map(|p| p.calculate(input_tokens, output_tokens, cached_tokens))
}

/// Format a USD amount with precision scaled to its size
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.4}", cost)
    } else if cost < 1.0 {
        format!("${:.3}", cost)
    } else {
        format!("${:.2}", cost)
    }
}
