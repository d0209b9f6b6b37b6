use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{multipart, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use crate::core::config::{check_url, require_secret, Config};
use crate::core::error::GenerationError;
use crate::services::pipeline::VisualStyle;

const STABILITY_KEY_ENV: &str = "STABILITY_API_KEY";
const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

pub const SAMPLE_IMAGE_STEM: &str = "dog-wearing-glasses";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String, // "stability" or "dalle"
    pub stability: Option<StabilityConfig>,
    pub dalle: Option<DalleConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            stability: None,
            dalle: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StabilityConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_stability_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_stability_endpoint(),
            output_format: OutputFormat::default(),
            negative_prompt: None,
            seed: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DalleConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_dalle_base_url")]
    pub base_url: String,
    #[serde(default = "default_dalle_model")]
    pub model: String,
    #[serde(default = "default_dalle_quality")]
    pub quality: String,
}

impl Default for DalleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_dalle_base_url(),
            model: default_dalle_model(),
            quality: default_dalle_quality(),
        }
    }
}

fn default_image_provider() -> String {
    "stability".to_string()
}
fn default_stability_endpoint() -> String {
    "https://api.stability.ai/v2beta/stable-image/generate/sd3".to_string()
}
fn default_dalle_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_dalle_model() -> String {
    "dall-e-3".to_string()
}
fn default_dalle_quality() -> String {
    "hd".to_string()
}

impl ImageConfig {
    pub fn validate(&self) -> Result<(), GenerationError> {
        match self.provider.as_str() {
            "stability" => {
                let cfg = self.stability.clone().unwrap_or_default();
                require_secret(cfg.api_key.as_deref(), STABILITY_KEY_ENV, "Stability")?;
                check_url("image.stability.endpoint", &cfg.endpoint)
            }
            "dalle" => {
                let cfg = self.dalle.clone().unwrap_or_default();
                require_secret(cfg.api_key.as_deref(), OPENAI_KEY_ENV, "OpenAI image")?;
                check_url("image.dalle.base_url", &cfg.base_url)
            }
            other => Err(GenerationError::Configuration(format!(
                "unknown image provider: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Square,
    Landscape,
    Portrait,
    Ultrawide,
    Classic,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Ultrawide => "21:9",
            AspectRatio::Classic => "3:2",
        }
    }

    /// Closest size DALL-E 3 accepts.
    fn dalle_size(&self) -> &'static str {
        match self {
            AspectRatio::Landscape | AspectRatio::Ultrawide | AspectRatio::Classic => "1792x1024",
            AspectRatio::Portrait => "1024x1792",
            AspectRatio::Square => "1024x1024",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StylePreset {
    ThreeDModel,
    AnalogFilm,
    Anime,
    Cinematic,
    ComicBook,
    DigitalArt,
    FantasyArt,
    LineArt,
    NeonPunk,
    Photographic,
    PixelArt,
}

impl StylePreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            StylePreset::ThreeDModel => "3d-model",
            StylePreset::AnalogFilm => "analog-film",
            StylePreset::Anime => "anime",
            StylePreset::Cinematic => "cinematic",
            StylePreset::ComicBook => "comic-book",
            StylePreset::DigitalArt => "digital-art",
            StylePreset::FantasyArt => "fantasy-art",
            StylePreset::LineArt => "line-art",
            StylePreset::NeonPunk => "neon-punk",
            StylePreset::Photographic => "photographic",
            StylePreset::PixelArt => "pixel-art",
        }
    }
}

impl From<VisualStyle> for StylePreset {
    fn from(style: VisualStyle) -> Self {
        match style {
            VisualStyle::Realistic => StylePreset::Photographic,
            VisualStyle::Cartoon => StylePreset::ComicBook,
            VisualStyle::Anime => StylePreset::Anime,
            VisualStyle::Pixar => StylePreset::ThreeDModel,
            VisualStyle::Gritty => StylePreset::Cinematic,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub style_preset: Option<StylePreset>,
    pub aspect_ratio: Option<AspectRatio>,
    pub output_format: OutputFormat,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl Default for ImageRequest {
    /// The fixed sample request: no style control, JPEG output.
    fn default() -> Self {
        Self {
            prompt: "dog wearing black glasses".to_string(),
            style_preset: None,
            aspect_ratio: None,
            output_format: OutputFormat::Jpeg,
            negative_prompt: None,
            seed: None,
        }
    }
}

impl ImageRequest {
    /// Storyboard frame in the project's style, 16:9.
    pub fn styled(prompt: &str, style: VisualStyle, output_format: OutputFormat) -> Self {
        Self {
            prompt: prompt.to_string(),
            style_preset: Some(style.into()),
            aspect_ratio: Some(AspectRatio::Landscape),
            output_format,
            negative_prompt: None,
            seed: None,
        }
    }

    fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest("prompt must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Generates one image and stores it at `output_path`. No retry.
#[async_trait]
pub trait ImageFetcher: Send + Sync + Debug {
    async fn fetch(&self, request: &ImageRequest, output_path: &Path) -> Result<(), GenerationError>;

    /// Format used for storyboard frames.
    fn default_format(&self) -> OutputFormat {
        OutputFormat::Png
    }

    /// Format of the bytes actually written for a request asking for `requested`.
    fn produced_format(&self, requested: OutputFormat) -> OutputFormat {
        requested
    }
}

pub fn create_image_fetcher(config: &Config) -> Result<Arc<dyn ImageFetcher>> {
    let image = &config.image;
    image.validate()?;
    info!("Initializing image generator for provider: {}", image.provider);
    match image.provider.as_str() {
        "stability" => {
            let cfg = image.stability.clone().unwrap_or_default();
            let key = require_secret(cfg.api_key.as_deref(), STABILITY_KEY_ENV, "Stability")?;
            Ok(Arc::new(StabilityClient::new(cfg, &key)))
        }
        "dalle" => {
            let cfg = image.dalle.clone().unwrap_or_default();
            let key = require_secret(cfg.api_key.as_deref(), OPENAI_KEY_ENV, "OpenAI image")?;
            Ok(Arc::new(DalleClient::new(cfg, &key)))
        }
        _ => Err(anyhow!("Unknown image provider: {}", image.provider)),
    }
}

async fn persist(output_path: &Path, bytes: &[u8]) -> Result<(), GenerationError> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(output_path, bytes).await?;
    debug!("Wrote {} bytes to {}", bytes.len(), output_path.display());
    Ok(())
}

async fn upstream_error(resp: reqwest::Response) -> GenerationError {
    let status = resp.status().as_u16();
    let payload = resp
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable error body: {}>", e));
    GenerationError::Upstream { status, payload }
}

// --- Stability (SD3) ---

#[derive(Debug)]
pub struct StabilityClient {
    config: StabilityConfig,
    api_key: String,
    client: reqwest::Client,
}

impl StabilityClient {
    pub fn new(config: StabilityConfig, api_key: &str) -> Self {
        Self {
            config,
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn form(&self, request: &ImageRequest) -> multipart::Form {
        let mut form = multipart::Form::new()
            .text("prompt", request.prompt.clone())
            .text("output_format", request.output_format.as_str());

        if let Some(ratio) = request.aspect_ratio {
            form = form.text("aspect_ratio", ratio.as_str());
        }
        if let Some(preset) = request.style_preset {
            form = form.text("style_preset", preset.as_str());
        }
        if let Some(negative) = request.negative_prompt.as_ref().or(self.config.negative_prompt.as_ref()) {
            form = form.text("negative_prompt", negative.clone());
        }
        if let Some(seed) = request.seed.or(self.config.seed) {
            form = form.text("seed", seed.to_string());
        }
        form
    }
}

#[async_trait]
impl ImageFetcher for StabilityClient {
    async fn fetch(&self, request: &ImageRequest, output_path: &Path) -> Result<(), GenerationError> {
        request.validate()?;

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .header("accept", "image/*")
            .multipart(self.form(request))
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(upstream_error(resp).await);
        }

        let bytes = resp.bytes().await?;
        persist(output_path, &bytes).await
    }

    fn default_format(&self) -> OutputFormat {
        self.config.output_format
    }
}

// --- DALL-E ---

#[derive(Debug)]
pub struct DalleClient {
    config: DalleConfig,
    api_key: String,
    client: reqwest::Client,
}

impl DalleClient {
    pub fn new(config: DalleConfig, api_key: &str) -> Self {
        Self {
            config,
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct DalleRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    quality: &'a str,
}

#[derive(Deserialize)]
struct DalleResponse {
    data: Vec<DalleImage>,
}

#[derive(Deserialize)]
struct DalleImage {
    url: Option<String>,
}

#[async_trait]
impl ImageFetcher for DalleClient {
    async fn fetch(&self, request: &ImageRequest, output_path: &Path) -> Result<(), GenerationError> {
        request.validate()?;

        let size = request.aspect_ratio.unwrap_or(AspectRatio::Square).dalle_size();
        let body = DalleRequest {
            model: &self.config.model,
            prompt: &request.prompt,
            n: 1,
            size,
            quality: &self.config.quality,
        };
        let url = format!("{}/images/generations", self.config.base_url.trim_end_matches('/'));

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(upstream_error(resp).await);
        }

        let result: DalleResponse = resp.json().await?;
        let image_url = result
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| GenerationError::Upstream {
                status: 200,
                payload: "response contained no image URL".to_string(),
            })?;

        // The signed URL must be used exactly as returned, query string included.
        let download = self.client.get(&image_url).send().await?;
        if !download.status().is_success() {
            return Err(upstream_error(download).await);
        }
        let bytes = download.bytes().await?;
        persist(output_path, &bytes).await
    }

    // DALL-E 3 always returns PNG.
    fn produced_format(&self, _requested: OutputFormat) -> OutputFormat {
        OutputFormat::Png
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::spawn_server;
    use axum::extract::{Multipart, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Fields = Arc<Mutex<HashMap<String, String>>>;

    fn stability_router(fields: Fields, status: AxumStatus, body: Vec<u8>) -> Router {
        Router::new().route(
            "/generate/sd3",
            post(move |headers: HeaderMap, mut multipart: Multipart| {
                let fields = fields.clone();
                let body = body.clone();
                async move {
                    let mut seen = HashMap::new();
                    while let Ok(Some(field)) = multipart.next_field().await {
                        let name = field.name().unwrap_or_default().to_string();
                        let value = field.text().await.unwrap_or_default();
                        seen.insert(name, value);
                    }
                    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
                        seen.insert("authorization".to_string(), auth.to_string());
                    }
                    *fields.lock().unwrap() = seen;
                    (status, body)
                }
            }),
        )
    }

    fn stability_client(base_url: &str) -> StabilityClient {
        let config = StabilityConfig {
            endpoint: format!("{}/generate/sd3", base_url),
            ..StabilityConfig::default()
        };
        StabilityClient::new(config, "sk-test")
    }

    #[tokio::test]
    async fn test_stability_success_writes_exact_bytes() -> Result<()> {
        let payload = vec![0xFFu8, 0xD8, 0xFF, 0x00, 0x42, 0x13];
        let fields: Fields = Arc::new(Mutex::new(HashMap::new()));
        let base_url = spawn_server(stability_router(fields.clone(), AxumStatus::OK, payload.clone())).await?;

        let temp_dir = tempfile::tempdir()?;
        let output = temp_dir.path().join("images").join("frame.png");
        let request = ImageRequest::styled("two rival chefs duel with ladles", VisualStyle::Pixar, OutputFormat::Png);

        stability_client(&base_url).fetch(&request, &output).await?;

        assert_eq!(std::fs::read(&output)?, payload);
        let fields = fields.lock().unwrap();
        assert_eq!(fields["prompt"], "two rival chefs duel with ladles");
        assert_eq!(fields["output_format"], "png");
        assert_eq!(fields["aspect_ratio"], "16:9");
        assert_eq!(fields["style_preset"], "3d-model");
        assert_eq!(fields["authorization"], "Bearer sk-test");
        assert!(!fields.contains_key("seed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stability_error_surfaces_payload() -> Result<()> {
        let body = br#"{"errors": ["bad prompt"]}"#.to_vec();
        let fields: Fields = Arc::new(Mutex::new(HashMap::new()));
        let base_url =
            spawn_server(stability_router(fields, AxumStatus::UNPROCESSABLE_ENTITY, body)).await?;

        let temp_dir = tempfile::tempdir()?;
        let output = temp_dir.path().join("never.jpeg");
        let err = stability_client(&base_url)
            .fetch(&ImageRequest::default(), &output)
            .await
            .unwrap_err();

        match &err {
            GenerationError::Upstream { status, payload } => {
                assert_eq!(*status, 422);
                assert!(payload.contains("bad prompt"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("bad prompt"));
        assert!(!output.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_before_any_request() {
        let client = stability_client("http://127.0.0.1:9");
        let request = ImageRequest {
            prompt: "  ".to_string(),
            ..ImageRequest::default()
        };
        let err = client.fetch(&request, Path::new("unused.png")).await.unwrap_err();
        assert!(matches!(err, GenerationError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_dalle_downloads_url_with_query_intact() -> Result<()> {
        let queries: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = queries.clone();
        let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let request_log = requests.clone();

        let router = Router::new()
            .route(
                "/images/generations",
                post(move |headers: HeaderMap, Json(body): Json<Value>| {
                    let request_log = request_log.clone();
                    async move {
                        request_log.lock().unwrap().push(body);
                        let host = headers
                            .get("host")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        Json(json!({
                            "data": [{ "url": format!("http://{}/files/frame.png?sig=abc&se=2030", host) }]
                        }))
                    }
                }),
            )
            .route(
                "/files/frame.png",
                get(move |Query(params): Query<HashMap<String, String>>| {
                    let recorder = recorder.clone();
                    async move {
                        recorder.lock().unwrap().push(params);
                        vec![1u8, 2, 3, 4]
                    }
                }),
            );
        let base_url = spawn_server(router).await?;

        let client = DalleClient::new(
            DalleConfig {
                base_url,
                ..DalleConfig::default()
            },
            "sk-test",
        );
        let temp_dir = tempfile::tempdir()?;
        let output = temp_dir.path().join("frame.png");
        let request = ImageRequest::styled("a ginger cat on a rooftop", VisualStyle::Cartoon, OutputFormat::Png);

        client.fetch(&request, &output).await?;

        assert_eq!(std::fs::read(&output)?, vec![1u8, 2, 3, 4]);
        let queries = queries.lock().unwrap();
        assert_eq!(queries[0]["sig"], "abc");
        assert_eq!(queries[0]["se"], "2030");
        let requests = requests.lock().unwrap();
        assert_eq!(requests[0]["size"], "1792x1024");
        assert_eq!(requests[0]["model"], "dall-e-3");
        assert_eq!(requests[0]["quality"], "hd");
        Ok(())
    }

    #[test]
    fn test_default_request_is_the_sample() {
        let request = ImageRequest::default();
        assert_eq!(request.prompt, "dog wearing black glasses");
        assert_eq!(request.output_format, OutputFormat::Jpeg);
        assert!(request.style_preset.is_none());
        assert!(request.aspect_ratio.is_none());
    }

    #[test]
    fn test_configured_output_format_reaches_the_backend() -> Result<()> {
        let config: ImageConfig =
            serde_yaml_ng::from_str("provider: stability\nstability:\n  api_key: sk\n  output_format: webp\n")?;
        let client = StabilityClient::new(config.stability.unwrap_or_default(), "sk");
        assert_eq!(client.default_format(), OutputFormat::Webp);
        assert_eq!(client.produced_format(OutputFormat::Jpeg), OutputFormat::Jpeg);

        let request = ImageRequest::styled("a neon alley", VisualStyle::Gritty, client.default_format());
        assert_eq!(request.output_format.as_str(), "webp");

        let dalle = DalleClient::new(DalleConfig::default(), "sk");
        assert_eq!(dalle.default_format(), OutputFormat::Png);
        assert_eq!(dalle.produced_format(OutputFormat::Jpeg), OutputFormat::Png);
        Ok(())
    }

    #[test]
    fn test_style_presets_follow_visual_style() {
        assert_eq!(StylePreset::from(VisualStyle::Realistic).as_str(), "photographic");
        assert_eq!(StylePreset::from(VisualStyle::Anime).as_str(), "anime");
        assert_eq!(StylePreset::from(VisualStyle::Gritty).as_str(), "cinematic");
    }

    #[test]
    fn test_validate_requires_known_provider() {
        let config = ImageConfig {
            provider: "midjourney".to_string(),
            ..ImageConfig::default()
        };
        assert!(matches!(config.validate(), Err(GenerationError::Configuration(_))));

        let config = ImageConfig {
            provider: "stability".to_string(),
            stability: Some(StabilityConfig {
                api_key: Some("sk".to_string()),
                endpoint: "nope".to_string(),
                ..StabilityConfig::default()
            }),
            dalle: None,
        };
        assert!(config.validate().is_err());
    }
}
