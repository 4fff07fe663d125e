//! Ollama auto-discovery helpers.
//!
//! Pings the configured Ollama server and fetches the locally downloaded
//! models from `/api/tags`, so the CLI can warn before the first embedding
//! call fails.

use serde::Deserialize;

/// A single model entry returned by Ollama's `/api/tags` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

/// Return the list of available models, or why the server is unreachable.
pub fn fetch_models(base_url: &str) -> Result<Vec<OllamaModel>, String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let response = reqwest::blocking::get(&url)
        .map_err(|e| format!("Ollama unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("Ollama returned HTTP {}", response.status()));
    }

    let tags: TagsResponse = response
        .json()
        .map_err(|e| format!("Failed to parse Ollama response: {}", e))?;

    Ok(tags.models)
}

/// `true` when `wanted` is among `models`. An untagged name matches its
/// `:latest` tag, as Ollama itself resolves it.
pub fn has_model(models: &[OllamaModel], wanted: &str) -> bool {
    let wanted = wanted.trim();
    models.iter().any(|m| {
        m.name == wanted
            || (!wanted.contains(':') && m.name.strip_suffix(":latest") == Some(wanted))
    })
}
