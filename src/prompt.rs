//! Persona generation from a PDF document
//!
//! Sends the document inline to a text model with persona-authoring
//! instructions and returns the generated system prompt.

use crate::gemini::{Blob, Content, Part};
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

pub const PROMPT_MODEL: &str = "gemini-2.5-flash";
pub const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const PDF_MIME: &str = "application/pdf";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const INSTRUCTIONS: &str = "\
Please analyze this company PDF document and create a comprehensive system prompt for an AI voice agent.

The system prompt should include:
1. **Company Name and Motto**: Extract and prominently feature the company name and any motto/tagline
2. **Company Information**: Include detailed information about the company (history, mission, values, achievements)
3. **Services Provided**: List and describe all services offered by the company

Format the system prompt as follows:
- Start with a clear role definition for the AI voice agent
- Include company identity (name, motto) prominently
- Provide comprehensive company background information
- Detail all services with descriptions
- Set appropriate tone and personality for customer interactions
- Include guidelines for handling customer queries
- Specify what to do if asked about services not offered
- Maintain professional yet approachable tone

Create a structured system message that would work well for a voice AI assistant representing this company.";

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("No file provided")]
    NoFile,

    #[error("Please upload a PDF file")]
    NotPdf,

    /// Detail is logged; callers only ever see the generic message.
    #[error("Failed to process the document and generate prompt. Please try again.")]
    Processing(String),
}

impl PromptError {
    /// HTTP-style status for the failure.
    pub fn status(&self) -> u16 {
        match self {
            PromptError::NoFile | PromptError::NotPdf => 400,
            PromptError::Processing(_) => 500,
        }
    }
}

/// Outcome as returned to a caller: `{"prompt": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptReply {
    Prompt { prompt: String },
    Error { error: String },
}

impl From<Result<String, PromptError>> for PromptReply {
    fn from(result: Result<String, PromptError>) -> Self {
        match result {
            Ok(prompt) => PromptReply::Prompt { prompt },
            Err(e) => PromptReply::Error {
                error: e.to_string(),
            },
        }
    }
}

/// An uploaded document
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Document {
    /// Load a file, typing it by extension.
    pub async fn load(path: &Path) -> Result<Self, PromptError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            error!("Failed to read {}: {}", path.display(), e);
            PromptError::NoFile
        })?;
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mime_type: if is_pdf { PDF_MIME } else { "application/octet-stream" }.to_string(),
            bytes,
        })
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

/// Concatenated text of the first candidate.
fn extract_text(response: GenerateContentResponse) -> Option<String> {
    let content = response.candidates.into_iter().next()?.content?;
    let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[derive(Debug, Clone)]
pub struct PromptGenerator {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl PromptGenerator {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, API_BASE)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: PROMPT_MODEL.to_string(),
        }
    }

    /// Generate persona text from `document`.
    pub async fn generate(&self, document: Option<&Document>) -> Result<String, PromptError> {
        let document = document
            .filter(|d| !d.bytes.is_empty())
            .ok_or(PromptError::NoFile)?;
        if document.mime_type != PDF_MIME {
            return Err(PromptError::NotPdf);
        }

        info!(
            "Generating persona from {} ({} bytes)",
            document.name,
            document.bytes.len()
        );
        self.request(document).await.map_err(|e| {
            error!("Error processing document: {}", e);
            e
        })
    }

    async fn request(&self, document: &Document) -> Result<String, PromptError> {
        let body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    Part {
                        text: Some(INSTRUCTIONS.to_string()),
                        inline_data: None,
                    },
                    Part {
                        text: None,
                        inline_data: Some(Blob {
                            mime_type: Some(PDF_MIME.to_string()),
                            data: general_purpose::STANDARD.encode(&document.bytes),
                        }),
                    },
                ],
            }],
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let processing = |e: reqwest::Error| PromptError::Processing(e.to_string());
        let response: GenerateContentResponse = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(processing)?
            .error_for_status()
            .map_err(processing)?
            .json()
            .await
            .map_err(processing)?;

        let text = extract_text(response)
            .ok_or_else(|| PromptError::Processing("model returned no text".to_string()))?;
        debug!("Generated persona of {} characters", text.len());
        Ok(text)
    }
}
