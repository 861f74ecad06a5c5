//! Nutrix Vision
//!
//! Food photo analysis through an OpenAI-compatible chat completions API

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const VISION_PROMPT: &str = "Analyze this food image and identify:\n\
1. The name of the dish or food item\n\
2. Approximate calories\n\
3. Protein content (in grams)\n\
4. Fat content (in grams)\n\
5. Carbohydrate content (in grams)\n\
\n\
Return the information in a structured format like this:\n\
{\n\
    \"food_name\": \"name of the dish\",\n\
    \"calories\": number,\n\
    \"proteins\": number,\n\
    \"fats\": number,\n\
    \"carbs\": number\n\
}\n\
\n\
Only return the JSON object, nothing else.";

fn default_food_name() -> String {
    "Unknown dish".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodAnalysis {
    #[serde(default = "default_food_name")]
    pub food_name: String,
    #[serde(default)]
    pub calories: f64,
    #[serde(default)]
    pub proteins: f64,
    #[serde(default)]
    pub fats: f64,
    #[serde(default)]
    pub carbs: f64,
}

/// Analysis failures. The Display text is relayed to the user as-is, so
/// variants read as plain sentences rather than debug dumps.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Image file not found")]
    ImageNotFound,
    #[error("Failed to read image file: {0}")]
    ImageRead(#[source] std::io::Error),
    #[error("Vision request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Vision provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("Failed to parse analysis results")]
    MalformedResponse,
}

#[async_trait]
pub trait FoodAnalyzer: Send + Sync {
    async fn analyze(&self, image_path: &Path) -> Result<FoodAnalysis, AnalysisError>;
}

pub struct OpenAiVision {
    api_key: String,
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiVision {
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout_secs: Option<u64>) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            model: model.to_string(),
            timeout_secs: timeout_secs.unwrap_or(60),
        }
    }
}

#[async_trait]
impl FoodAnalyzer for OpenAiVision {
    async fn analyze(&self, image_path: &Path) -> Result<FoodAnalysis, AnalysisError> {
        info!("Analyzing food image: {}", image_path.display());

        if !image_path.exists() {
            return Err(AnalysisError::ImageNotFound);
        }
        let image_bytes = tokio::fs::read(image_path)
            .await
            .map_err(AnalysisError::ImageRead)?;

        let mime_type = guess_mime_type(image_path);
        let image_data = format!(
            "data:{};base64,{}",
            mime_type,
            base64::engine::general_purpose::STANDARD.encode(&image_bytes)
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": VISION_PROMPT
                        },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": image_data
                            }
                        }
                    ]
                }
            ],
            "max_tokens": 500
        });

        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;
        let response = client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AnalysisError::Provider {
                status: status.as_u16(),
                body: raw.chars().take(400).collect(),
            });
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&raw).map_err(|_| AnalysisError::MalformedResponse)?;
        let text = parse_response_text(&parsed).ok_or(AnalysisError::MalformedResponse)?;

        let analysis = extract_analysis(&text)?;
        info!("Food analysis successful: {}", analysis.food_name);
        Ok(analysis)
    }
}

/// Canned results keyed off the file name, for development without API calls.
pub struct MockAnalyzer;

#[async_trait]
impl FoodAnalyzer for MockAnalyzer {
    async fn analyze(&self, image_path: &Path) -> Result<FoodAnalysis, AnalysisError> {
        if !image_path.exists() {
            return Err(AnalysisError::ImageNotFound);
        }

        let name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        debug!("Mock analysis for file: {}", name);

        let analysis = if name.contains("pizza") {
            FoodAnalysis {
                food_name: "Pizza".to_string(),
                calories: 285.0,
                proteins: 12.0,
                fats: 10.0,
                carbs: 36.0,
            }
        } else if name.contains("salad") {
            FoodAnalysis {
                food_name: "Garden Salad".to_string(),
                calories: 150.0,
                proteins: 3.0,
                fats: 10.0,
                carbs: 12.0,
            }
        } else if name.contains("burger") {
            FoodAnalysis {
                food_name: "Hamburger".to_string(),
                calories: 550.0,
                proteins: 25.0,
                fats: 30.0,
                carbs: 45.0,
            }
        } else {
            FoodAnalysis {
                food_name: "Unknown Food".to_string(),
                calories: 300.0,
                proteins: 15.0,
                fats: 12.0,
                carbs: 30.0,
            }
        };

        Ok(analysis)
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

fn parse_response_text(value: &serde_json::Value) -> Option<String> {
    let message = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))?;

    if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    if let Some(content_items) = message.get("content").and_then(|v| v.as_array()) {
        let mut parts = Vec::new();
        for item in content_items {
            if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
        }
        if !parts.is_empty() {
            return Some(parts.join("\n"));
        }
    }

    None
}

/// The model is asked for bare JSON but often wraps it in prose. Take the
/// widest brace-delimited slice and parse that.
fn extract_analysis(text: &str) -> Result<FoodAnalysis, AnalysisError> {
    let start = text.find('{').ok_or(AnalysisError::MalformedResponse)?;
    let end = text.rfind('}').ok_or(AnalysisError::MalformedResponse)?;
    if end < start {
        return Err(AnalysisError::MalformedResponse);
    }

    serde_json::from_str(&text[start..=end]).map_err(|_| AnalysisError::MalformedResponse)
}
