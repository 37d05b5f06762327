//! Google Translate REST post-step for providers without built-in
//! translation. Best effort: a 5 s budget, skipped on any failure,
//! never blocks the audio path.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

const TRANSLATE_URL: &str = "https://translation.googleapis.com/language/translate/v2";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Translate `text` into `target`; `None` means "use the original".
pub async fn translate(text: &str, target: &str, api_key: &str) -> Option<String> {
    if text.trim().is_empty() || target == "none" {
        return None;
    }

    let client = reqwest::Client::builder().timeout(TIMEOUT).build().ok()?;
    let response = client
        .post(TRANSLATE_URL)
        .query(&[("key", api_key)])
        .json(&json!({
            "q": text,
            "target": target,
            "format": "text",
        }))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "translate request failed, keeping original text");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(status = %response.status(), "translate rejected, keeping original text");
        return None;
    }

    let body: serde_json::Value = response.json().await.ok()?;
    body["data"]["translations"][0]["translatedText"]
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_text_skipped() {
        assert!(translate("", "en", "key").await.is_none());
        assert!(translate("   ", "en", "key").await.is_none());
    }

    #[tokio::test]
    async fn test_target_none_skipped() {
        assert!(translate("hola", "none", "key").await.is_none());
    }
}
