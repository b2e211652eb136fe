//! Cache fingerprints.
//!
//! Keys are content-addressed and tenant-agnostic: two requests that would
//! produce the same provider output share a key regardless of who sent
//! them. `tenant_id`, `user_id`, `correlation_id`, `user`, and `stream`
//! must never enter the digest. Canonical JSON comes for free from
//! `serde_json::Value`, whose object maps serialize with sorted keys;
//! absent optional fields are omitted rather than serialized as null, so
//! "not set" and "set to default" hash differently only when the client
//! actually sent a value.

use crate::models::{CompletionRequest, EmbeddingRequest};
use serde_json::{Map, Value};

pub const COMPLETION_PREFIX: &str = "completion:";
pub const EMBEDDING_PREFIX: &str = "embedding:";

/// Fingerprint for a completion request.
pub fn completion_key(req: &CompletionRequest) -> String {
    let mut fields = Map::new();
    fields.insert("model".into(), Value::String(req.model.clone()));
    fields.insert(
        "messages".into(),
        serde_json::to_value(&req.messages).unwrap_or(Value::Null),
    );
    insert_opt(&mut fields, "max_tokens", req.max_tokens.map(Into::into));
    insert_opt_f64(&mut fields, "temperature", req.temperature.map(f64::from));
    insert_opt_f64(&mut fields, "top_p", req.top_p.map(f64::from));
    if let Some(stop) = &req.stop {
        fields.insert(
            "stop".into(),
            Value::Array(stop.iter().map(|s| Value::String(s.clone())).collect()),
        );
    }
    insert_opt_f64(
        &mut fields,
        "presence_penalty",
        req.presence_penalty.map(f64::from),
    );
    insert_opt_f64(
        &mut fields,
        "frequency_penalty",
        req.frequency_penalty.map(f64::from),
    );

    format!("{COMPLETION_PREFIX}{}", digest(&Value::Object(fields)))
}

/// Fingerprint for an embedding request.
pub fn embedding_key(req: &EmbeddingRequest) -> String {
    let mut fields = Map::new();
    fields.insert("model".into(), Value::String(req.model.clone()));
    fields.insert(
        "input".into(),
        Value::Array(req.input.iter().map(|s| Value::String(s.clone())).collect()),
    );
    if let Some(format) = &req.encoding_format {
        fields.insert("encoding_format".into(), Value::String(format.clone()));
    }
    insert_opt(&mut fields, "dimensions", req.dimensions.map(Into::into));

    format!("{EMBEDDING_PREFIX}{}", digest(&Value::Object(fields)))
}

fn insert_opt(fields: &mut Map<String, Value>, name: &str, value: Option<u64>) {
    if let Some(v) = value {
        fields.insert(name.into(), Value::from(v));
    }
}

fn insert_opt_f64(fields: &mut Map<String, Value>, name: &str, value: Option<f64>) {
    if let Some(v) = value {
        fields.insert(name.into(), Value::from(v));
    }
}

fn digest(canonical: &Value) -> String {
    let bytes = serde_json::to_vec(canonical).unwrap_or_default();
    format!("{:x}", md5::compute(bytes))
}
