//! Tolerant model-name matching against a node's checkpoint catalog.
//!
//! Requested names come from users and scripts written against other
//! nodes, so they rarely match byte-for-byte. Strategies are tried in
//! order and the first hit wins:
//!
//! 1. [`MatchStrategy::Exact`] -- identical to the canonical title or an alias.
//! 2. [`MatchStrategy::NormalizedPath`] -- equal after unifying path
//!    separators, dropping a trailing `[hash]` and ignoring case.
//! 3. [`MatchStrategy::FileName`] -- equal file stem (no directories, no
//!    extension).

/// Known checkpoint file extensions stripped by the file-name strategy.
const MODEL_EXTENSIONS: &[&str] = &[".safetensors", ".ckpt", ".pt", ".pth", ".bin", ".gguf"];

/// One catalog entry: the node's canonical identifier plus any other
/// names the node reports for the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub canonical: String,
    pub aliases: Vec<String>,
}

/// Which strategy produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    Exact,
    NormalizedPath,
    FileName,
}

/// Resolve `requested` against `candidates`.
pub fn resolve_model_name<'a>(
    requested: &str,
    candidates: &'a [ModelCandidate],
) -> Option<(&'a ModelCandidate, MatchStrategy)> {
    let requested = requested.trim();
    if requested.is_empty() {
        return None;
    }

    if let Some(c) = candidates
        .iter()
        .find(|c| names(c).any(|n| n == requested))
    {
        return Some((c, MatchStrategy::Exact));
    }

    let wanted = normalize_path(requested);
    if let Some(c) = candidates
        .iter()
        .find(|c| names(c).any(|n| normalize_path(n) == wanted))
    {
        return Some((c, MatchStrategy::NormalizedPath));
    }

    let wanted = file_stem(requested);
    if wanted.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|c| names(c).any(|n| file_stem(n) == wanted))
        .map(|c| (c, MatchStrategy::FileName))
}

fn names(c: &ModelCandidate) -> impl Iterator<Item = &String> {
    std::iter::once(&c.canonical).chain(c.aliases.iter())
}

/// Unify separators, drop a trailing ` [hash]` and a leading `./`, and
/// lowercase.
pub fn normalize_path(name: &str) -> String {
    let name = strip_hash_suffix(name.trim()).replace('\\', "/");
    let name = name.trim_start_matches("./");
    name.to_lowercase()
}

/// Last path segment without a known model extension, lowercased.
pub fn file_stem(name: &str) -> String {
    let normalized = normalize_path(name);
    let last = normalized.rsplit('/').next().unwrap_or("");
    MODEL_EXTENSIONS
        .iter()
        .find_map(|ext| last.strip_suffix(ext))
        .unwrap_or(last)
        .to_string()
}

/// Forge titles look like `sdxl/juggernaut.safetensors [a1b2c3d4]`.
fn strip_hash_suffix(name: &str) -> &str {
    match name.rfind(" [") {
        Some(idx) if name.ends_with(']') => &name[..idx],
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<ModelCandidate> {
        vec![
            ModelCandidate {
                canonical: "sdxl/juggernautXL_v9.safetensors [c9e3e68f89]".into(),
                aliases: vec![
                    "juggernautXL_v9".into(),
                    "/models/Stable-diffusion/sdxl/juggernautXL_v9.safetensors".into(),
                ],
            },
            ModelCandidate {
                canonical: "flux1-dev-fp8.safetensors [1be961341b]".into(),
                aliases: vec!["flux1-dev-fp8".into()],
            },
        ]
    }

    #[test]
    fn exact_title_matches() {
        let cat = catalog();
        let (c, s) = resolve_model_name("flux1-dev-fp8.safetensors [1be961341b]", &cat).unwrap();
        assert_eq!(c.canonical, cat[1].canonical);
        assert_eq!(s, MatchStrategy::Exact);
    }

    #[test]
    fn windows_separators_match_normalized() {
        let cat = catalog();
        let (c, s) = resolve_model_name("SDXL\\juggernautXL_v9.safetensors", &cat).unwrap();
        assert_eq!(c.canonical, cat[0].canonical);
        assert_eq!(s, MatchStrategy::NormalizedPath);
    }

    #[test]
    fn bare_file_name_matches() {
        let cat = catalog();
        let (c, s) = resolve_model_name("other/dir/juggernautXL_v9.ckpt", &cat).unwrap();
        assert_eq!(c.canonical, cat[0].canonical);
        assert_eq!(s, MatchStrategy::FileName);
    }

    #[test]
    fn unknown_model_is_none() {
        assert!(resolve_model_name("dreamshaper_8", &catalog()).is_none());
    }

    #[test]
    fn empty_request_is_none() {
        assert!(resolve_model_name("  ", &catalog()).is_none());
    }

    #[test]
    fn file_stem_strips_hash_and_extension() {
        assert_eq!(file_stem("a/b/Model.safetensors [abc]"), "model");
    }
}
