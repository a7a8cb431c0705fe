//! Static price table: USD per million tokens, matched by model prefix.
//! Models not listed (local Ollama pulls, fine-tunes) cost zero.

pub struct ModelPrice {
    /// Longest matching prefix wins (e.g. "gpt-4o-mini" before "gpt-4o").
    pub prefix: &'static str,
    pub input_usd_per_1m: f64,
    pub output_usd_per_1m: f64,
}

pub const PRICE_TABLE: &[ModelPrice] = &[
    // Anthropic
    ModelPrice {
        prefix: "claude-opus-4",
        input_usd_per_1m: 15.0,
        output_usd_per_1m: 75.0,
    },
    ModelPrice {
        prefix: "claude-sonnet-4",
        input_usd_per_1m: 3.0,
        output_usd_per_1m: 15.0,
    },
    ModelPrice {
        prefix: "claude-3-5-haiku",
        input_usd_per_1m: 0.8,
        output_usd_per_1m: 4.0,
    },
    ModelPrice {
        prefix: "claude-haiku-4",
        input_usd_per_1m: 1.0,
        output_usd_per_1m: 5.0,
    },
    // OpenAI
    ModelPrice {
        prefix: "gpt-4o-mini",
        input_usd_per_1m: 0.15,
        output_usd_per_1m: 0.6,
    },
    ModelPrice {
        prefix: "gpt-4o",
        input_usd_per_1m: 2.5,
        output_usd_per_1m: 10.0,
    },
    ModelPrice {
        prefix: "gpt-4.1-mini",
        input_usd_per_1m: 0.4,
        output_usd_per_1m: 1.6,
    },
    ModelPrice {
        prefix: "gpt-4.1",
        input_usd_per_1m: 2.0,
        output_usd_per_1m: 8.0,
    },
    ModelPrice {
        prefix: "o4-mini",
        input_usd_per_1m: 1.1,
        output_usd_per_1m: 4.4,
    },
    // Google
    ModelPrice {
        prefix: "gemini-2.5-pro",
        input_usd_per_1m: 1.25,
        output_usd_per_1m: 10.0,
    },
    ModelPrice {
        prefix: "gemini-2.5-flash",
        input_usd_per_1m: 0.3,
        output_usd_per_1m: 2.5,
    },
    ModelPrice {
        prefix: "gemini-2.0-flash",
        input_usd_per_1m: 0.1,
        output_usd_per_1m: 0.4,
    },
    ModelPrice {
        prefix: "gemini-1.5-pro",
        input_usd_per_1m: 1.25,
        output_usd_per_1m: 5.0,
    },
];

/// Look up the price row for a model, longest prefix match.
pub fn lookup(model: &str) -> Option<&'static ModelPrice> {
    PRICE_TABLE
        .iter()
        .filter(|p| model.starts_with(p.prefix))
        .max_by_key(|p| p.prefix.len())
}

/// Cost in USD for a completed request. Zero for unpriced (local) models.
pub fn cost(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    match lookup(model) {
        Some(price) => {
            (input_tokens as f64 / 1e6) * price.input_usd_per_1m
                + (output_tokens as f64 / 1e6) * price.output_usd_per_1m
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let price = lookup("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(price.prefix, "gpt-4o-mini");
    }

    #[test]
    fn cost_formula() {
        // 1M in + 1M out on claude-sonnet-4-5 = 3 + 15 USD.
        let usd = cost("claude-sonnet-4-5", 1_000_000, 1_000_000);
        assert!((usd - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_are_free() {
        assert_eq!(cost("llama3.3:70b", 5000, 5000), 0.0);
    }
}
