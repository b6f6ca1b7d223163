//! Gradio queue submission payloads.
//!
//! A generation request is a positional `data` array for the node's
//! txt2img function. Callers either pass the array verbatim under
//! `generation_params.data` or use named fields, which are laid out in
//! the node's argument order with defaults for anything omitted. In both
//! cases slot 0 carries the task-attempt token.

use serde::Serialize;
use serde_json::{json, Value};

/// Key in `generation_params` naming the requested checkpoint.
pub const MODEL_PARAM: &str = "model";

/// Key in `generation_params` holding a verbatim positional array.
pub const RAW_DATA_PARAM: &str = "data";

/// Named txt2img arguments after the task token, in node argument order.
const TXT2IMG_LAYOUT: &[&str] = &[
    "prompt",
    "negative_prompt",
    "styles",
    "batch_count",
    "batch_size",
    "cfg_scale",
    "height",
    "width",
    "enable_hr",
    "denoising_strength",
    "hr_scale",
    "hr_upscaler",
    "hr_second_pass_steps",
    "hr_resize_x",
    "hr_resize_y",
    "hr_checkpoint_name",
    "hr_sampler_name",
    "hr_scheduler",
    "hr_prompt",
    "hr_negative_prompt",
];

fn layout_default(name: &str) -> Value {
    match name {
        "styles" => json!([]),
        "batch_count" | "batch_size" => json!(1),
        "cfg_scale" => json!(7.0),
        "height" | "width" => json!(512),
        "enable_hr" => json!(false),
        "denoising_strength" => json!(0.7),
        "hr_scale" => json!(2.0),
        "hr_upscaler" => json!("Latent"),
        "hr_second_pass_steps" | "hr_resize_x" | "hr_resize_y" => json!(0),
        "hr_checkpoint_name" => json!("Use same checkpoint"),
        "hr_sampler_name" => json!("Use same sampler"),
        "hr_scheduler" => json!("Use same scheduler"),
        _ => json!(""),
    }
}

/// Body of `POST /queue/join`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueJoinRequest {
    pub fn_index: u32,
    pub session_hash: String,
    pub data: Vec<Value>,
    pub event_data: Value,
    pub trigger_id: Option<i64>,
}

impl QueueJoinRequest {
    /// The task-attempt token embedded in slot 0, if any.
    pub fn task_token(&self) -> Option<&str> {
        self.data
            .first()
            .and_then(Value::as_str)
            .and_then(|s| s.strip_prefix("task("))
            .and_then(|s| s.strip_suffix(')'))
    }
}

/// Correlation ids minted for one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionIds {
    /// Event-stream session key.
    pub session_hash: String,
    /// Task-attempt token, used by the progress poll.
    pub task_token: String,
}

impl SubmissionIds {
    pub fn generate() -> Self {
        let session = uuid::Uuid::new_v4().simple().to_string();
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self {
            session_hash: session[..11].to_string(),
            task_token: token[..15].to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("generation_params must be a JSON object")]
    NotAnObject,

    #[error("generation_params.{field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: &'static str },
}

/// Format a task token the way the node expects it in slot 0.
pub fn task_marker(token: &str) -> String {
    format!("task({token})")
}

/// The checkpoint name requested by `params`, if any.
pub fn requested_model(params: &Value) -> Option<&str> {
    params
        .get(MODEL_PARAM)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build the queue submission for one dispatch attempt.
///
/// `model_title` is the catalog-resolved checkpoint; named-field requests
/// pin it through the settings override slot.
pub fn build_request(
    fn_index: u32,
    ids: &SubmissionIds,
    params: &Value,
    model_title: Option<&str>,
) -> Result<QueueJoinRequest, PayloadError> {
    let fields = params.as_object().ok_or(PayloadError::NotAnObject)?;
    let marker = Value::String(task_marker(&ids.task_token));

    let data = match fields.get(RAW_DATA_PARAM) {
        Some(Value::Array(raw)) => {
            let mut data = raw.clone();
            match data.first_mut() {
                Some(slot) => *slot = marker,
                None => data.push(marker),
            }
            data
        }
        Some(_) => {
            return Err(PayloadError::InvalidField {
                field: "data",
                reason: "expected an array",
            })
        }
        None => {
            let mut data = Vec::with_capacity(TXT2IMG_LAYOUT.len() + 2);
            data.push(marker);
            data.extend(
                TXT2IMG_LAYOUT
                    .iter()
                    .map(|name| fields.get(*name).cloned().unwrap_or_else(|| layout_default(name))),
            );

            let mut overrides: Vec<Value> = match fields.get("override_settings_texts") {
                Some(Value::Array(texts)) => texts.clone(),
                Some(_) => {
                    return Err(PayloadError::InvalidField {
                        field: "override_settings_texts",
                        reason: "expected an array",
                    })
                }
                None => Vec::new(),
            };
            if let Some(title) = model_title {
                overrides.push(Value::String(format!("Model hash: {title}")));
            }
            data.push(Value::Array(overrides));

            match fields.get("script_args") {
                Some(Value::Array(args)) => data.extend(args.iter().cloned()),
                Some(_) => {
                    return Err(PayloadError::InvalidField {
                        field: "script_args",
                        reason: "expected an array",
                    })
                }
                None => {}
            }
            data
        }
    };

    let trigger_id = fields.get("trigger_id").and_then(Value::as_i64);

    Ok(QueueJoinRequest {
        fn_index,
        session_hash: ids.session_hash.clone(),
        data,
        event_data: Value::Null,
        trigger_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ids() -> SubmissionIds {
        SubmissionIds {
            session_hash: "sess1234567".into(),
            task_token: "tok000000000001".into(),
        }
    }

    #[test]
    fn generated_ids_are_unique_and_sized() {
        let a = SubmissionIds::generate();
        let b = SubmissionIds::generate();
        assert_eq!(a.session_hash.len(), 11);
        assert_eq!(a.task_token.len(), 15);
        assert_ne!(a.task_token, b.task_token);
    }

    #[test]
    fn named_fields_fill_layout_with_defaults() {
        let params = json!({"prompt": "a lighthouse", "width": 1024, "model": "sdxl/base"});
        let req = build_request(257, &ids(), &params, Some("sdxl/base.safetensors [31e35c80fc]")).unwrap();

        assert_eq!(req.fn_index, 257);
        assert_eq!(req.session_hash, "sess1234567");
        assert_eq!(req.data[0], json!("task(tok000000000001)"));
        assert_eq!(req.data[1], json!("a lighthouse"));
        assert_eq!(req.data[2], json!(""));
        assert_eq!(req.data[8], json!(1024));
        let overrides = &req.data[TXT2IMG_LAYOUT.len() + 1];
        assert_eq!(overrides, &json!(["Model hash: sdxl/base.safetensors [31e35c80fc]"]));
        assert_eq!(req.task_token(), Some("tok000000000001"));
        assert_eq!(req.event_data, Value::Null);
    }

    #[test]
    fn raw_data_is_used_verbatim_except_slot_zero() {
        let params = json!({"data": ["task(old)", "prompt", 20, null], "trigger_id": 16});
        let req = build_request(3, &ids(), &params, None).unwrap();
        assert_eq!(req.data, vec![json!("task(tok000000000001)"), json!("prompt"), json!(20), Value::Null]);
        assert_eq!(req.trigger_id, Some(16));
    }

    #[test]
    fn empty_raw_data_gets_token() {
        let req = build_request(3, &ids(), &json!({"data": []}), None).unwrap();
        assert_eq!(req.data.len(), 1);
    }

    #[test]
    fn script_args_are_appended() {
        let params = json!({"script_args": [0, "Euler a", 30]});
        let req = build_request(1, &ids(), &params, None).unwrap();
        let tail = &req.data[req.data.len() - 3..];
        assert_eq!(tail, &[json!(0), json!("Euler a"), json!(30)]);
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert_matches!(build_request(1, &ids(), &json!([1, 2]), None), Err(PayloadError::NotAnObject));
        assert_matches!(
            build_request(1, &ids(), &json!({"data": "nope"}), None),
            Err(PayloadError::InvalidField { field: "data", .. })
        );
    }

    #[test]
    fn requested_model_ignores_blank() {
        assert_eq!(requested_model(&json!({"model": " sdxl "})), Some("sdxl"));
        assert_eq!(requested_model(&json!({"model": ""})), None);
        assert_eq!(requested_model(&json!({})), None);
    }
}
