//! Ordered extraction strategies over raw node event bodies.
//!
//! Node builds disagree about where progress, previews and results live,
//! so each field is read by a list of strategies tried in order. A body
//! that matches no strategy simply carries no information for that field.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use forgefleet_core::hashing::sha256_hex;
use forgefleet_core::progress::{fraction_percent, step_percent};

static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*/\s*(\d+)").expect("valid regex"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("valid regex"));

/// Nesting depth searched for artifacts.
const MAX_ARTIFACT_DEPTH: usize = 4;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

type ProgressStrategy = fn(&Value) -> Option<f64>;

const PROGRESS_STRATEGIES: &[ProgressStrategy] = &[direct_percentage, step_pair, status_text];

/// Raw percentage (not clamped) from the first matching strategy.
pub fn extract_progress(body: &Value) -> Option<f64> {
    PROGRESS_STRATEGIES.iter().find_map(|strategy| strategy(body))
}

/// The body itself plus the nested objects nodes commonly wrap data in.
fn scopes(body: &Value) -> impl Iterator<Item = &Value> {
    std::iter::once(body)
        .chain(["data", "output", "state"].into_iter().filter_map(move |k| body.get(k)))
        .filter(|v| v.is_object())
}

fn number(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

fn direct_percentage(body: &Value) -> Option<f64> {
    scopes(body).find_map(|scope| {
        if let Some(p) = number(scope, "percent").or_else(|| number(scope, "percentage")) {
            return (0.0..=100.0).contains(&p).then_some(p);
        }
        let p = number(scope, "progress")?;
        fraction_percent(p).or_else(|| (0.0..=100.0).contains(&p).then_some(p))
    })
}

const STEP_KEYS: &[(&str, &str)] = &[
    ("step", "total_steps"),
    ("step", "steps"),
    ("sampling_step", "sampling_steps"),
    ("value", "max"),
];

fn step_pair(body: &Value) -> Option<f64> {
    let tracked = body
        .get("progress_data")
        .and_then(Value::as_array)
        .and_then(|units| {
            units.iter().find_map(|unit| {
                step_percent(number(unit, "index")?, number(unit, "length")?)
            })
        });
    if tracked.is_some() {
        return tracked;
    }

    scopes(body).find_map(|scope| {
        STEP_KEYS
            .iter()
            .find_map(|(step, total)| step_percent(number(scope, step)?, number(scope, total)?))
    })
}

fn status_text(body: &Value) -> Option<f64> {
    let texts = [
        body.get("textinfo"),
        body.get("desc"),
        body.get("message"),
        body.pointer("/progress_data/0/desc"),
    ];
    texts
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(parse_progress_text)
}

/// Parse `"Sampling step 5/20"` or `"25%"` style text.
pub fn parse_progress_text(text: &str) -> Option<f64> {
    if let Some(caps) = STEP_RE.captures(text) {
        let step: f64 = caps[1].parse().ok()?;
        let total: f64 = caps[2].parse().ok()?;
        if let Some(p) = step_percent(step, total) {
            return Some(p);
        }
    }
    let caps = PERCENT_RE.captures(text)?;
    caps[1].parse().ok()
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

const PREVIEW_POINTERS: &[&str] = &[
    "/live_preview",
    "/preview",
    "/data/live_preview",
    "/output/live_preview",
    "/current_image",
];

/// Inline preview image (a `data:image/...` URL) if the body carries one.
pub fn extract_preview(body: &Value) -> Option<String> {
    let direct = PREVIEW_POINTERS
        .iter()
        .filter_map(|p| body.pointer(p))
        .filter_map(Value::as_str)
        .find(|s| is_data_url(s));
    if let Some(found) = direct {
        return Some(found.to_string());
    }

    body.pointer("/output/data")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .find(|s| is_data_url(s))
        })
        .map(str::to_string)
}

fn is_data_url(s: &str) -> bool {
    s.starts_with("data:image/")
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Where a result image can be obtained from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    /// Base64 payload, with or without a `data:` URL prefix.
    Inline(String),
    /// A path in the node's output directory, fetched via `/file=`.
    NodePath(String),
    /// An absolute URL.
    Url(String),
}

impl ArtifactRef {
    /// Stable identity used for de-duplication and completion fingerprints.
    pub fn identity(&self) -> String {
        match self {
            ArtifactRef::Inline(data) => format!("inline:{}", sha256_hex(data.as_bytes())),
            ArtifactRef::NodePath(path) => format!("path:{path}"),
            ArtifactRef::Url(url) => format!("url:{url}"),
        }
    }
}

/// Every result artifact referenced by a completion body, de-duplicated by
/// identity, in order of first appearance.
pub fn extract_artifacts(body: &Value) -> Vec<ArtifactRef> {
    let mut found = Vec::new();

    for root in [body.pointer("/output/data"), body.get("data"), body.get("output")]
        .into_iter()
        .flatten()
        .filter(|v| v.is_array())
    {
        collect(root, 0, &mut found);
    }

    // API-style responses carry raw base64 strings under `images`.
    for scope in [Some(body), body.get("output")].into_iter().flatten() {
        if let Some(images) = scope.get("images").and_then(Value::as_array) {
            found.extend(
                images
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(|s| ArtifactRef::Inline(s.to_string())),
            );
        }
    }

    let mut seen = HashSet::new();
    found.retain(|a| seen.insert(a.identity()));
    found
}

fn collect(value: &Value, depth: usize, out: &mut Vec<ArtifactRef>) {
    if depth > MAX_ARTIFACT_DEPTH {
        return;
    }
    match value {
        Value::String(s) => {
            if is_data_url(s) {
                out.push(ArtifactRef::Inline(s.clone()));
            } else if is_image_url(s) {
                out.push(ArtifactRef::Url(s.clone()));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, depth + 1, out);
            }
        }
        Value::Object(map) => {
            // Gallery item: {"image": FileData, "caption": ...}
            if let Some(image) = map.get("image") {
                collect(image, depth + 1, out);
                return;
            }
            if let Some(path) = map.get("path").and_then(Value::as_str) {
                out.push(ArtifactRef::NodePath(path.to_string()));
                return;
            }
            let is_file = map.get("is_file").and_then(Value::as_bool).unwrap_or(false);
            if let (true, Some(name)) = (is_file, map.get("name").and_then(Value::as_str)) {
                out.push(ArtifactRef::NodePath(name.to_string()));
                return;
            }
            if let Some(url) = map.get("url").and_then(Value::as_str) {
                out.push(ArtifactRef::Url(url.to_string()));
                return;
            }
            if let Some(data) = map.get("data").and_then(Value::as_str).filter(|s| is_data_url(s)) {
                out.push(ArtifactRef::Inline(data.to_string()));
            }
        }
        _ => {}
    }
}

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp"];

fn is_image_url(s: &str) -> bool {
    if !(s.starts_with("http://") || s.starts_with("https://")) {
        return false;
    }
    let lower = s.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    lower.contains("/file=") || IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

// ---------------------------------------------------------------------------
// Task state (progress poll)
// ---------------------------------------------------------------------------

/// Queue state flags from a progress-poll response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskState {
    pub active: bool,
    pub queued: bool,
    pub completed: bool,
}

impl TaskState {
    /// The node still owns the task.
    pub fn is_running(&self) -> bool {
        (self.active || self.queued) && !self.completed
    }
}

pub fn task_state(body: &Value) -> TaskState {
    let flag = |key: &str| body.get(key).and_then(Value::as_bool).unwrap_or(false);
    TaskState {
        active: flag("active"),
        queued: flag("queued"),
        completed: flag("completed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- progress ---------------------------------------------------------

    #[test]
    fn poll_fraction_is_converted() {
        let body = json!({"active": true, "progress": 0.25, "textinfo": "Sampling step 9/20"});
        assert_eq!(extract_progress(&body), Some(25.0));
    }

    #[test]
    fn explicit_percent_wins_over_steps() {
        let body = json!({"percent": 40, "step": 1, "total_steps": 20});
        assert_eq!(extract_progress(&body), Some(40.0));
    }

    #[test]
    fn gradio_progress_data_step_pair() {
        let body = json!({"msg": "progress", "progress_data": [{"index": 5, "length": 20, "unit": "steps"}]});
        assert_eq!(extract_progress(&body), Some(25.0));
    }

    #[test]
    fn nested_value_max_pair() {
        let body = json!({"data": {"value": 3, "max": 4}});
        assert_eq!(extract_progress(&body), Some(75.0));
    }

    #[test]
    fn free_text_fallbacks() {
        assert_eq!(parse_progress_text("Sampling step 10/40"), Some(25.0));
        assert_eq!(parse_progress_text(" 62.5% |#####"), Some(62.5));
        assert_eq!(parse_progress_text("Loading model"), None);
        let body = json!({"progress_data": [{"index": null, "length": null, "desc": "step 2/8"}]});
        assert_eq!(extract_progress(&body), Some(25.0));
    }

    #[test]
    fn no_match_is_no_information() {
        assert_eq!(extract_progress(&json!({"msg": "heartbeat"})), None);
        assert_eq!(extract_progress(&json!({"progress": null})), None);
    }

    // -- preview ----------------------------------------------------------

    #[test]
    fn preview_from_poll_and_from_output() {
        let poll = json!({"live_preview": "data:image/png;base64,AAAA"});
        assert_eq!(extract_preview(&poll).as_deref(), Some("data:image/png;base64,AAAA"));

        let generating = json!({"output": {"data": [null, "data:image/jpeg;base64,BBBB"]}});
        assert_eq!(extract_preview(&generating).as_deref(), Some("data:image/jpeg;base64,BBBB"));

        assert!(extract_preview(&json!({"live_preview": "/tmp/x.png"})).is_none());
    }

    // -- artifacts --------------------------------------------------------

    #[test]
    fn gallery_file_data_prefers_node_path() {
        let body = json!({
            "msg": "process_completed",
            "success": true,
            "output": {"data": [
                [
                    {"image": {"path": "/outputs/txt2img/00001.png", "url": "http://127.0.0.1:7860/file=/outputs/txt2img/00001.png"}, "caption": null},
                    {"image": {"path": "/outputs/txt2img/00002.png"}, "caption": null}
                ],
                "{\"prompt\": \"harbor\"}",
                "<p>info</p>"
            ]}
        });
        assert_eq!(
            extract_artifacts(&body),
            vec![
                ArtifactRef::NodePath("/outputs/txt2img/00001.png".into()),
                ArtifactRef::NodePath("/outputs/txt2img/00002.png".into()),
            ]
        );
    }

    #[test]
    fn legacy_file_entries_and_urls() {
        let body = json!({"output": {"data": [[
            {"name": "/tmp/gradio/abc.png", "data": null, "is_file": true},
            "https://cdn.example.com/out/final.webp?sig=1"
        ]]}});
        assert_eq!(
            extract_artifacts(&body),
            vec![
                ArtifactRef::NodePath("/tmp/gradio/abc.png".into()),
                ArtifactRef::Url("https://cdn.example.com/out/final.webp?sig=1".into()),
            ]
        );
    }

    #[test]
    fn duplicates_are_removed_by_identity() {
        let body = json!({"output": {"data": [[
            {"image": {"path": "/o/1.png"}},
            {"image": {"path": "/o/1.png"}},
            "data:image/png;base64,QUJD",
            "data:image/png;base64,QUJD"
        ]]}});
        assert_eq!(extract_artifacts(&body).len(), 2);
    }

    #[test]
    fn raw_base64_images_list() {
        let body = json!({"images": ["iVBORw0KGgo=", ""]});
        assert_eq!(
            extract_artifacts(&body),
            vec![ArtifactRef::Inline("iVBORw0KGgo=".into())]
        );
    }

    #[test]
    fn empty_completion_has_no_artifacts() {
        let body = json!({"msg": "process_completed", "success": true, "output": {"data": [[], "", ""]}});
        assert!(extract_artifacts(&body).is_empty());
    }

    #[test]
    fn identity_distinguishes_kinds() {
        let inline = ArtifactRef::Inline("abc".into()).identity();
        assert!(inline.starts_with("inline:"));
        assert_eq!(inline.len(), "inline:".len() + 64);
        assert_eq!(ArtifactRef::NodePath("/a".into()).identity(), "path:/a");
    }

    // -- task state -------------------------------------------------------

    #[test]
    fn task_state_flags() {
        let running = task_state(&json!({"active": true, "queued": false, "completed": false}));
        assert!(running.is_running());
        let done = task_state(&json!({"active": false, "queued": false, "completed": true}));
        assert!(!done.is_running());
        assert_eq!(task_state(&json!({})), TaskState::default());
    }
}
