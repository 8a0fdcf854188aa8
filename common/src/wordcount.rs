use serde_json::Value;

use crate::shuffle::KvPair;

/// Limpia un token: solo alfanumérico y '_', en minúscula.
fn clean_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

/// Map del wordcount: un par (palabra, 1) por token, en orden de aparición.
pub fn tokenize(text: &str) -> Vec<KvPair> {
    text.split_whitespace()
        .map(clean_token)
        .filter(|w| !w.is_empty())
        .map(|w| KvPair::new(w, 1))
        .collect()
}

/// Reduce del wordcount: suma de los valores numéricos (los demás cuentan 0).
pub fn sum_values(values: &[Value]) -> Value {
    let total: u64 = values.iter().filter_map(Value::as_u64).sum();
    Value::from(total)
}
