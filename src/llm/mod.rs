// LLM module
// Hosted multimodal generation and the image summaries ingestion relies on

pub mod rasterize;


use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::LlmConfig;
use crate::{RagError, Result};

pub use rasterize::{PageRasterizer, PdftoppmRasterizer};

/// Prompt sent with every image or rendered page during ingestion
pub const SUMMARY_PROMPT: &str = "Summarise the image in more than 1000 words.";

const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024;

/// One element of a model input sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    #[inline]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Wrap encoded image bytes, detecting the format from magic bytes
    #[inline]
    pub fn image(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(RagError::InvalidInput("image data is empty".to_string()));
        }

        if data.len() > MAX_IMAGE_SIZE {
            return Err(RagError::InvalidInput(format!(
                "image is too large: {} bytes (max: {} bytes)",
                data.len(),
                MAX_IMAGE_SIZE
            )));
        }

        let format = image::guess_format(&data)
            .map_err(|e| RagError::InvalidInput(format!("unsupported image data: {e}")))?;

        Ok(Self::InlineData {
            mime_type: format.to_mime_type().to_string(),
            data,
        })
    }

    #[inline]
    pub fn is_image(&self) -> bool {
        matches!(self, Self::InlineData { .. })
    }
}

/// A hosted model that turns an ordered part sequence into text
pub trait GenerativeModel: Send + Sync {
    fn generate(&self, parts: &[Part]) -> Result<String>;
}

/// Ask `model` for a long-form description of one image
#[inline]
pub fn summarize_image(model: &dyn GenerativeModel, image: Part) -> Result<String> {
    let summary = model.generate(&[Part::text(SUMMARY_PROMPT), image])?;
    if summary.trim().is_empty() {
        return Err(RagError::ExternalService(
            "summarization returned no text".to_string(),
        ));
    }
    Ok(summary)
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    Inline { inline_data: InlineBlob },
}

#[derive(Debug, Serialize)]
struct InlineBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl From<&Part> for RequestPart {
    fn from(part: &Part) -> Self {
        match part {
            Part::Text(text) => Self::Text { text: text.clone() },
            Part::InlineData { mime_type, data } => Self::Inline {
                inline_data: InlineBlob {
                    mime_type: mime_type.clone(),
                    data: STANDARD.encode(data),
                },
            },
        }
    }
}

/// Gemini `generateContent` client
#[derive(Debug, Clone)]
pub struct GeminiClient {
    base_url: Url,
    model: String,
    api_key: String,
    agent: ureq::Agent,
}

impl GeminiClient {
    #[inline]
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| RagError::Config(format!("invalid LLM base URL {}: {e}", config.base_url)))?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            api_key: api_key.into(),
            agent,
        })
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> anyhow::Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("/v1beta/models/{}:generateContent", self.model))
            .context("Failed to build generation URL")?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    fn request_body(parts: &[Part]) -> GenerateRequest {
        GenerateRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: parts.iter().map(RequestPart::from).collect(),
            }],
        }
    }

    fn response_text(response: GenerateResponse) -> Option<String> {
        let text: String = response
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

impl GenerativeModel for GeminiClient {
    fn generate(&self, parts: &[Part]) -> Result<String> {
        if parts.is_empty() {
            return Err(RagError::InvalidInput("model input is empty".to_string()));
        }

        let url = self.endpoint()?;
        let body = serde_json::to_string(&Self::request_body(parts))
            .context("Failed to serialize generation request")?;

        debug!(
            "Calling {} with {} parts ({} images)",
            self.model,
            parts.len(),
            parts.iter().filter(|p| p.is_image()).count()
        );

        let response_text = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| {
                warn!("Generation request to {} failed: {}", self.model, e);
                RagError::ExternalService(format!("generation request failed: {e}"))
            })?;

        let response: GenerateResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::ExternalService(format!("malformed generation response: {e}")))?;

        Self::response_text(response).ok_or_else(|| {
            RagError::ExternalService(format!("{} returned no candidate text", self.model))
        })
    }
}
