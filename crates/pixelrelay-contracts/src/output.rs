use serde_json::Value;

/// Object keys that may hold image locations, in visiting order.
const URL_KEYS: [&str; 5] = ["url", "image_url", "image", "images", "output"];

/// Flattens an arbitrarily nested provider output into its string leaves.
///
/// Strings are kept (trimmed, non-empty, first occurrence wins), arrays are
/// walked in order, and objects are descended through the keys in
/// `URL_KEYS` only. Numbers, booleans, nulls and unknown keys are dropped.
pub fn flatten_output_urls(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_output_urls(value, &mut out);
    out
}

pub fn collect_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                collect_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in URL_KEYS {
                if let Some(nested) = obj.get(key) {
                    collect_output_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}
