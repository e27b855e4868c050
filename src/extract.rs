use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelField {
    Missing,
    Value(String),
    NotAString,
}

impl ModelField {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(model) => Some(model),
            Self::Missing | Self::NotAString => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub body: Bytes,
    pub model: ModelField,
    pub stream: bool,
}

#[derive(Deserialize)]
struct Probe {
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    stream: Option<Value>,
}

fn classify(value: Option<Value>) -> ModelField {
    match value {
        None | Some(Value::Null) => ModelField::Missing,
        Some(Value::String(model)) => ModelField::Value(model),
        Some(_) => ModelField::NotAString,
    }
}

/// Decodes only the `model` and `stream` keys; every other field is ignored.
pub fn extract_model(body: Bytes) -> Result<ModelRequest, GatewayError> {
    let starts_with_object = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if !starts_with_object {
        tracing::debug!(body_bytes = body.len(), "request body is not a JSON object");
        return Err(GatewayError::MalformedRequest);
    }

    let probe: Probe = serde_json::from_slice(&body).map_err(|err| {
        tracing::debug!(error = %err, "failed to decode request body");
        GatewayError::MalformedRequest
    })?;

    let model = classify(probe.model);
    if model == ModelField::NotAString {
        tracing::debug!("request model field is not a string");
        return Err(GatewayError::MalformedRequest);
    }

    Ok(ModelRequest {
        body,
        model,
        stream: matches!(probe.stream, Some(Value::Bool(true))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_from_varied_bodies() {
        let cases: &[(&str, Option<ModelField>)] = &[
            (
                r#"{"model":"gpt-4o-mini","messages":[]}"#,
                Some(ModelField::Value("gpt-4o-mini".to_string())),
            ),
            (r#"{"model":""}"#, Some(ModelField::Value(String::new()))),
            (r#"{}"#, Some(ModelField::Missing)),
            (r#"{"model":null}"#, Some(ModelField::Missing)),
            (
                r#"{"messages":[{"role":"user","content":"hi"}],"temperature":0.2}"#,
                Some(ModelField::Missing),
            ),
            (
                "  \n{\"model\": \"deepseek-r1\"}\n",
                Some(ModelField::Value("deepseek-r1".to_string())),
            ),
            (r#"{"model":42}"#, None),
            (r#"{"model":["gpt-4o"]}"#, None),
            (r#"{"model":{"name":"gpt-4o"}}"#, None),
            (r#"{"model":"gpt-4o""#, None),
            (r#"["gpt-4o"]"#, None),
            ("not json", None),
            ("", None),
        ];

        for (body, expected) in cases {
            let result = extract_model(Bytes::from(body.to_string()));
            match expected {
                Some(model) => assert_eq!(&result.unwrap().model, model, "body {body:?}"),
                None => assert!(
                    matches!(result, Err(GatewayError::MalformedRequest)),
                    "body {body:?}"
                ),
            }
        }
    }

    #[test]
    fn body_is_preserved_byte_for_byte() {
        let raw = "{ \"model\" : \"gpt-4o\",\n  \"messages\": [ {\"role\":\"user\",\"content\":\"héllo\"} ],\"z\":1 }";
        let input = Bytes::from(raw);
        let req = extract_model(input.clone()).unwrap();
        assert_eq!(req.body, input);
        assert_eq!(req.body.as_ptr(), input.as_ptr());
    }

    #[test]
    fn stream_flag_requires_literal_true() {
        let on = extract_model(Bytes::from_static(br#"{"model":"m","stream":true}"#)).unwrap();
        assert!(on.stream);

        for body in [
            r#"{"model":"m","stream":false}"#,
            r#"{"model":"m","stream":"true"}"#,
            r#"{"model":"m"}"#,
        ] {
            assert!(!extract_model(Bytes::from(body)).unwrap().stream, "{body}");
        }
    }
}
