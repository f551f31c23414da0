// Per-model pricing for estimated cost reporting. Dated deployment names
// ("gpt-4o-mini-2024-07-18") resolve via prefix match.

/// (input, output) USD per 1M tokens.
const MODEL_PRICING_USD_PER_1M: [(&str, (f64, f64)); 5] = [
    ("gpt-4.1-nano", (0.10, 0.40)),
    ("gpt-4.1-mini", (0.40, 1.60)),
    ("gpt-4o-mini", (0.15, 0.60)),
    ("text-embedding-3-small", (0.02, 0.00)),
    ("text-embedding-3-large", (0.13, 0.00)),
];

/// Resolve input/output price per 1M tokens for a model name.
/// Unknown models price at zero rather than guessing.
pub fn price_for_model(model: &str) -> (f64, f64) {
    for (known, pricing) in MODEL_PRICING_USD_PER_1M {
        if model == known {
            return pricing;
        }
    }
    for (known, pricing) in MODEL_PRICING_USD_PER_1M {
        if model.starts_with(known) {
            return pricing;
        }
    }
    (0.0, 0.0)
}

/// Estimate request cost in USD from token counts and model pricing.
pub fn estimate_model_cost_usd(model: &str, prompt_tokens: i64, completion_tokens: i64) -> f64 {
    let (input_price, output_price) = price_for_model(model);
    let prompt = prompt_tokens.max(0) as f64;
    let completion = completion_tokens.max(0) as f64;
    (prompt * input_price) / 1_000_000.0 + (completion * output_price) / 1_000_000.0
}
