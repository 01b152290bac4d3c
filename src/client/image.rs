//! Gemini `generateContent` image adapter.
//!
//! Request layout: one content with the prompt as the first text part,
//! followed by every [`InlineImage`] as an `inlineData` part, plus a
//! `generationConfig` asking for `TEXT` + `IMAGE` output at the configured
//! aspect ratio and size. The first `inlineData` part of the first candidate
//! is the result; it is returned as a `data:` URI.

use super::{ImageProvider, ImageRequest, InlineImage};
use crate::config::GenerationConfig;
use crate::error::{FlipbookError, GenerationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "gemini";

/// Image provider backed by a Gemini image model.
#[derive(Debug, Clone)]
pub struct GeminiImageProvider {
    http: reqwest::Client,
    base: String,
    api_key: Option<String>,
    model: String,
    aspect_ratio: String,
    image_size: String,
}

impl GeminiImageProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self, FlipbookError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| FlipbookError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: config.image_api_base.clone(),
            api_key: config.image_api_key.clone(),
            model: config.image_model.clone(),
            aspect_ratio: config.image_aspect_ratio.clone(),
            image_size: config.image_size.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base, self.model)
    }

    fn body<'a>(&'a self, request: &'a ImageRequest) -> GenerateContentRequest<'a> {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        parts.push(RequestPart::Text {
            text: &request.prompt,
        });
        parts.extend(
            request
                .images
                .iter()
                .map(|inline_data| RequestPart::Image { inline_data }),
        );
        GenerateContentRequest {
            contents: vec![RequestContent { parts }],
            generation_config: GenerationSettings {
                response_modalities: ["TEXT", "IMAGE"],
                image_config: ImageSettings {
                    aspect_ratio: &self.aspect_ratio,
                    image_size: &self.image_size,
                },
            },
        }
    }
}

#[async_trait]
impl ImageProvider for GeminiImageProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, request: &ImageRequest) -> Result<String, GenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Configuration {
                provider: PROVIDER.into(),
                detail: "image API key not configured".into(),
            })?;

        debug!(
            "{}: requesting {} with {} inline image(s)",
            PROVIDER,
            self.model,
            request.images.len()
        );
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| GenerationError::from_message(PROVIDER, None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = if text.is_empty() {
                status.canonical_reason().unwrap_or("").to_string()
            } else {
                text
            };
            return Err(GenerationError::from_message(
                PROVIDER,
                Some(status.as_u16()),
                format!("{} - {}", status.as_u16(), detail),
            ));
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
            GenerationError::from_message(PROVIDER, None, format!("unreadable response: {e}"))
        })?;
        first_image(parsed).ok_or_else(|| GenerationError::Transient {
            provider: PROVIDER.into(),
            status: None,
            message: "no image found in response".into(),
        })
    }
}

/// First inline image of the first candidate, as a data URI.
fn first_image(response: GenerateContentResponse) -> Option<String> {
    let content = response.candidates.into_iter().next()?.content?;
    content.parts.into_iter().find_map(|part| {
        let data = part.inline_data?;
        if data.data.is_empty() {
            return None;
        }
        Some(
            InlineImage {
                mime_type: data.mime_type.unwrap_or_else(|| "image/jpeg".into()),
                data: data.data,
            }
            .to_data_uri(),
        )
    })
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationSettings<'a>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text {
        text: &'a str,
    },
    Image {
        #[serde(rename = "inlineData")]
        inline_data: &'a InlineImage,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationSettings<'a> {
    response_modalities: [&'static str; 2],
    image_config: ImageSettings<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSettings<'a> {
    aspect_ratio: &'a str,
    image_size: &'a str,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    inline_data: Option<ResponseInlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseInlineData {
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(key: Option<&str>) -> GeminiImageProvider {
        let mut builder = GenerationConfig::builder().image_api_base("http://127.0.0.1:9/proxy/");
        if let Some(k) = key {
            builder = builder.image_api_key(k);
        }
        GeminiImageProvider::new(&builder.build().unwrap()).unwrap()
    }

    #[test]
    fn request_body_orders_prompt_then_images() {
        let p = provider(Some("k"));
        let req = ImageRequest {
            prompt: "render".into(),
            images: vec![
                InlineImage::from_bytes("image/png", b"ref"),
                InlineImage::from_bytes("image/jpeg", b"left"),
            ],
        };
        let body = serde_json::to_value(p.body(&req)).unwrap();
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0], json!({"text": "render"}));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(
            body["generationConfig"],
            json!({
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": {"aspectRatio": "1:1", "imageSize": "2K"}
            })
        );
        assert_eq!(
            p.endpoint(),
            "http://127.0.0.1:9/proxy/v1beta/models/gemini-3-pro-image-preview:generateContent"
        );
    }

    #[test]
    fn picks_first_inline_image() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is your book"},
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                    {"inlineData": {"mimeType": "image/png", "data": "BBBB"}}
                ]}
            }]
        }))
        .unwrap();
        assert_eq!(
            first_image(response).as_deref(),
            Some("data:image/png;base64,AAAA")
        );
    }

    #[test]
    fn text_only_response_has_no_image() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "I can't do that"}]}}]
        }))
        .unwrap();
        assert!(first_image(response).is_none());
        let empty: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert!(first_image(empty).is_none());
    }

    #[tokio::test]
    async fn missing_key_is_a_configuration_error() {
        let err = provider(None)
            .generate(&ImageRequest {
                prompt: "x".into(),
                images: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Configuration { .. }));
        assert!(err.is_permanent());
    }
}
