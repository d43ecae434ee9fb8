use serde_json::Value;

pub const DEFAULT_DIMENSIONS: usize = 256;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EmbeddingUnavailable {
    #[error("context yields no embeddable features")]
    NoFeatures,
    #[error("embedding contains non-finite components")]
    NonFinite,
    #[error("embedding backend failed: {0}")]
    Backend(String),
}

/// Turns a decision context into a fixed-length vector.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// # Errors
    /// Returns [`EmbeddingUnavailable`] when no usable vector can be built.
    fn embed(&self, context: &Value) -> Result<Vec<f32>, EmbeddingUnavailable>;
}

/// Deterministic feature-hashing embedder. Each `path=value` pair and each
/// lowercase word of string values lands in a signed bucket; the vector is
/// L2-normalised.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FeatureHashEmbedder {
    dimensions: usize,
}

impl FeatureHashEmbedder {
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for FeatureHashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl Embedder for FeatureHashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn embed(&self, context: &Value) -> Result<Vec<f32>, EmbeddingUnavailable> {
        let mut tokens = Vec::new();
        collect_tokens("", context, &mut tokens);
        if tokens.is_empty() {
            return Err(EmbeddingUnavailable::NoFeatures);
        }

        let mut vector = vec![0.0_f64; self.dimensions];
        for token in &tokens {
            let hash = fnv1a(token);
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|component| component * component).sum::<f64>().sqrt();
        if !norm.is_finite() {
            return Err(EmbeddingUnavailable::NonFinite);
        }
        if norm <= f64::EPSILON {
            // Every token cancelled out against another.
            return Err(EmbeddingUnavailable::NoFeatures);
        }
        Ok(vector.into_iter().map(|component| (component / norm) as f32).collect())
    }
}

fn collect_tokens(path: &str, value: &Value, tokens: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => tokens.push(format!("{path}={flag}")),
        Value::Number(number) => tokens.push(format!("{path}={number}")),
        Value::String(text) => {
            let text = text.trim().to_lowercase();
            if text.is_empty() {
                return;
            }
            tokens.push(format!("{path}={text}"));
            tokens.extend(
                text.split(|ch: char| !ch.is_alphanumeric())
                    .filter(|word| word.len() > 1)
                    .map(|word| format!("w:{word}")),
            );
        }
        Value::Array(items) => {
            for item in items {
                collect_tokens(path, item, tokens);
            }
        }
        Value::Object(entries) => {
            for (key, nested) in entries {
                let nested_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                collect_tokens(&nested_path, nested, tokens);
            }
        }
    }
}

fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
