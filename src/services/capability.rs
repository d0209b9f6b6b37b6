use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::core::error::GenerationError;
use crate::core::io::Storage;
use crate::services::image::{ImageFetcher, ImageRequest, OutputFormat};
use crate::services::llm::ToolSpec;
use crate::services::pipeline::{CapabilityKind, VisualStyle};
use crate::utils::text::short_digest;

/// A side-effecting operation the reasoning service may call while resolving a step.
#[async_trait]
pub trait Capability: Send + Sync {
    fn kind(&self) -> CapabilityKind;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    async fn invoke(&self, arguments: &Value) -> Result<String>;

    fn spec(&self) -> ToolSpec {
        ToolSpec::function(self.kind().as_str(), self.description(), self.parameters())
    }
}

/// Maps declared capability kinds to concrete implementations.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<CapabilityKind, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory listing and file reading confined to `project_dir`, plus image
    /// generation when a fetcher is available.
    pub fn for_project(
        project_dir: &Path,
        storage: Arc<dyn Storage>,
        fetcher: Option<Arc<dyn ImageFetcher>>,
        style: VisualStyle,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ListDirectoryCapability::new(project_dir, storage.clone())));
        registry.register(Arc::new(ReadFileCapability::new(project_dir, storage)));
        if let Some(fetcher) = fetcher {
            registry.register(Arc::new(GenerateImageCapability::new(project_dir, fetcher, style)));
        }
        registry
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.entries.insert(capability.kind(), capability);
    }

    pub fn contains(&self, kind: CapabilityKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn resolve(&self, kinds: &[CapabilityKind]) -> Result<Vec<Arc<dyn Capability>>, GenerationError> {
        kinds
            .iter()
            .map(|kind| {
                self.entries.get(kind).cloned().ok_or_else(|| {
                    GenerationError::Configuration(format!(
                        "capability '{}' is not available",
                        kind.as_str()
                    ))
                })
            })
            .collect()
    }
}

fn string_arg<'a>(arguments: &'a Value, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// Joins a model-supplied relative path onto `root`, refusing anything that escapes it.
fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf> {
    let requested = Path::new(requested);
    let mut resolved = root.to_path_buf();
    for component in requested.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => bail!("path '{}' must stay inside the project directory", requested.display()),
        }
    }
    Ok(resolved)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

pub struct ListDirectoryCapability {
    root: PathBuf,
    storage: Arc<dyn Storage>,
}

impl ListDirectoryCapability {
    pub fn new(root: &Path, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.to_path_buf(),
            storage,
        }
    }
}

#[async_trait]
impl Capability for ListDirectoryCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::ListDirectory
    }

    fn description(&self) -> &str {
        "List the files written so far for this movie. Optionally pass a sub-directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Sub-directory relative to the movie folder" }
            }
        })
    }

    async fn invoke(&self, arguments: &Value) -> Result<String> {
        let dir = match string_arg(arguments, "path") {
            Some(sub) => resolve_within(&self.root, sub)?,
            None => self.root.clone(),
        };
        let entries = self.storage.list(&dir).await?;
        if entries.is_empty() {
            return Ok(format!("No files in {}", relative_display(&self.root, &dir)));
        }
        let listing: Vec<String> = entries
            .iter()
            .map(|p| format!("- {}", relative_display(&self.root, p)))
            .collect();
        Ok(format!("Files:\n{}", listing.join("\n")))
    }
}

pub struct ReadFileCapability {
    root: PathBuf,
    storage: Arc<dyn Storage>,
}

impl ReadFileCapability {
    pub fn new(root: &Path, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.to_path_buf(),
            storage,
        }
    }
}

#[async_trait]
impl Capability for ReadFileCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::ReadFile
    }

    fn description(&self) -> &str {
        "Read the full content of a file written for this movie."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the movie folder, e.g. treatment.md" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, arguments: &Value) -> Result<String> {
        let requested = string_arg(arguments, "path").ok_or_else(|| anyhow!("missing 'path' argument"))?;
        let path = resolve_within(&self.root, requested)?;
        self.storage
            .read_to_string(&path)
            .await
            .with_context(|| format!("Cannot read {}", requested))
    }
}

pub struct GenerateImageCapability {
    root: PathBuf,
    fetcher: Arc<dyn ImageFetcher>,
    style: VisualStyle,
}

impl GenerateImageCapability {
    pub fn new(root: &Path, fetcher: Arc<dyn ImageFetcher>, style: VisualStyle) -> Self {
        Self {
            root: root.to_path_buf(),
            fetcher,
            style,
        }
    }
}

#[async_trait]
impl Capability for GenerateImageCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::GenerateImage
    }

    fn description(&self) -> &str {
        "Generate an image from a detailed text description. Returns the image reference to embed in Markdown."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": { "type": "string", "description": "Complete visual description of the frame" }
            },
            "required": ["description"]
        })
    }

    async fn invoke(&self, arguments: &Value) -> Result<String> {
        let description =
            string_arg(arguments, "description").ok_or_else(|| anyhow!("missing 'description' argument"))?;
        let request = ImageRequest::styled(description, self.style, self.fetcher.default_format());
        let reference = format!(
            "images/image_{}.{}",
            short_digest(description, 16),
            self.fetcher.produced_format(request.output_format).as_str()
        );
        let output = self.root.join(&reference);

        info!("Generating image {}", reference);
        self.fetcher.fetch(&request, &output).await?;
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingFetcher {
        format: Option<OutputFormat>,
        prompts: Mutex<Vec<(ImageRequest, PathBuf)>>,
    }

    #[async_trait]
    impl ImageFetcher for RecordingFetcher {
        fn default_format(&self) -> OutputFormat {
            self.format.unwrap_or_default()
        }

        async fn fetch(&self, request: &ImageRequest, output_path: &Path) -> Result<(), GenerationError> {
            self.prompts
                .lock()
                .unwrap()
                .push((request.clone(), output_path.to_path_buf()));
            std::fs::create_dir_all(output_path.parent().unwrap())?;
            std::fs::write(output_path, b"png")?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_file_stays_inside_project() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("demo");
        std::fs::create_dir_all(&root)?;
        std::fs::write(root.join("treatment.md"), "A kitchen war.")?;
        std::fs::write(temp_dir.path().join("secret.txt"), "nope")?;

        let cap = ReadFileCapability::new(&root, Arc::new(NativeStorage::new()));
        assert_eq!(cap.invoke(&json!({"path": "treatment.md"})).await?, "A kitchen war.");
        assert_eq!(cap.invoke(&json!({"path": "./treatment.md"})).await?, "A kitchen war.");
        assert!(cap.invoke(&json!({"path": "../secret.txt"})).await.is_err());
        assert!(cap.invoke(&json!({"path": "/etc/hostname"})).await.is_err());
        assert!(cap.invoke(&json!({})).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_directory_uses_relative_names() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("demo");
        std::fs::create_dir_all(root.join("images"))?;
        std::fs::write(root.join("idea_draft.md"), "plot")?;

        let cap = ListDirectoryCapability::new(&root, Arc::new(NativeStorage::new()));
        let listing = cap.invoke(&json!({})).await?;
        assert!(listing.contains("- idea_draft.md"));
        assert!(listing.contains("- images"));

        let empty = cap.invoke(&json!({"path": "images"})).await?;
        assert!(empty.starts_with("No files"));
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_image_returns_stable_reference() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("demo");
        let fetcher = Arc::new(RecordingFetcher::default());
        let cap = GenerateImageCapability::new(&root, fetcher.clone(), VisualStyle::Pixar);

        let args = json!({"description": "Little Bean, a tiny white chihuahua, close-up, pixar, 3d animated"});
        let first = cap.invoke(&args).await?;
        let second = cap.invoke(&args).await?;

        assert_eq!(first, second);
        assert!(first.starts_with("images/image_"));
        assert!(first.ends_with(".png"));
        assert!(root.join(&first).exists());

        let calls = fetcher.prompts.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0.aspect_ratio.map(|a| a.as_str()), Some("16:9"));
        assert_eq!(calls[0].1, root.join(&first));
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_image_uses_fetcher_format() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("demo");
        let fetcher = Arc::new(RecordingFetcher {
            format: Some(OutputFormat::Webp),
            ..RecordingFetcher::default()
        });
        let cap = GenerateImageCapability::new(&root, fetcher.clone(), VisualStyle::Anime);

        let reference = cap.invoke(&json!({"description": "Tiger leaps across a neon rooftop"})).await?;

        assert!(reference.ends_with(".webp"));
        assert!(root.join(&reference).exists());
        assert_eq!(fetcher.prompts.lock().unwrap()[0].0.output_format, OutputFormat::Webp);
        Ok(())
    }

    #[test]
    fn test_registry_reports_missing_capability() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::for_project(
            temp_dir.path(),
            Arc::new(NativeStorage::new()),
            None,
            VisualStyle::Cartoon,
        );

        assert!(registry.contains(CapabilityKind::ReadFile));
        assert!(registry
            .resolve(&[CapabilityKind::ListDirectory, CapabilityKind::ReadFile])
            .is_ok());
        let err = registry.resolve(&[CapabilityKind::GenerateImage]).err().unwrap();
        assert!(matches!(err, GenerationError::Configuration(_)));
    }

    #[test]
    fn test_spec_uses_capability_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cap = ReadFileCapability::new(temp_dir.path(), Arc::new(NativeStorage::new()));
        assert_eq!(cap.spec().name(), "read_file");
    }
}
