use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Select, Text};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::core::config::Config;
use crate::core::error::GenerationError;
use crate::core::io::{NativeStorage, Storage};
use crate::services::agent::ReasoningService;
use crate::services::capability::CapabilityRegistry;
use crate::services::image::{ImageFetcher, ImageRequest, SAMPLE_IMAGE_STEM};
use crate::services::pipeline::{
    ContentStep, Genre, Pipeline, PipelineBuilder, Project, StepResult, VisualStyle,
};
use crate::services::workflow::{CancelSignal, EventSink, PipelineExecutor, PipelineOutcome};
use crate::utils::text::is_safe_identifier;

const DEFAULT_SLUG: &str = "little_bean";
const DEFAULT_NAME: &str = "The Little Bean and Tiger go Rogue!";
const DEFAULT_PREMISE: &str = "A hilarious childrens animated adventure about Little Bean (real name: Lola), \
a neurotic little white chihuaha/something cross, and Tiger, a brave ginger cat. \
Together they have to get to Nevada City to save their owner Indigo from a math-related disaster...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    WriteMovie,
    GenerateSampleImage,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::WriteMovie => f.write_str("Write Movie"),
            Action::GenerateSampleImage => f.write_str("Generate Sample Image"),
        }
    }
}

/// Progress bar with the current step's role and title.
pub struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    pub fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl EventSink for ProgressSink {
    fn step_started(&self, index: usize, total: usize, step: &ContentStep) {
        self.bar.set_length(total as u64);
        self.bar.set_position(index as u64);
        self.bar.set_message(format!("{}: {}", step.role.name, step.title));
    }

    fn step_finished(&self, index: usize, _total: usize, result: &StepResult, reused: bool) {
        let marker = if reused { "reused" } else { "done" };
        self.bar.println(format!("  [{}] {}", marker, result.path.display()));
        self.bar.set_position(index as u64 + 1);
    }

    fn log_line(&self, line: &str) {
        self.bar.println(line);
    }
}

pub fn choose_action() -> Result<Action> {
    let action = Select::new(
        "What would you like to do?",
        vec![Action::WriteMovie, Action::GenerateSampleImage],
    )
    .prompt()?;
    Ok(action)
}

pub fn default_project() -> Result<Project, GenerationError> {
    Project::new(
        DEFAULT_SLUG,
        DEFAULT_NAME,
        Genre::Comedy,
        VisualStyle::Cartoon,
        DEFAULT_PREMISE,
    )
}

pub fn prompt_project() -> Result<Project> {
    let mut slug = Text::new("Movie slug, e.g. 'the_heist' (used for file naming):")
        .with_default(DEFAULT_SLUG)
        .prompt()?;
    while !is_safe_identifier(&slug) {
        println!("Use lowercase letters, digits, '_' or '-' only.");
        slug = Text::new("Movie slug:").with_default(DEFAULT_SLUG).prompt()?;
    }

    let name = Text::new("Movie name, e.g. 'The Heist':")
        .with_default(DEFAULT_NAME)
        .prompt()?;
    let genre = Select::new("Genre of the movie:", Genre::ALL.to_vec())
        .with_starting_cursor(1)
        .prompt()?;
    let style = Select::new("Visual style of the movie:", VisualStyle::ALL.to_vec())
        .with_starting_cursor(1)
        .prompt()?;
    let premise = Text::new("A brief idea for the movie:")
        .with_default(DEFAULT_PREMISE)
        .prompt()?;

    Ok(Project::new(&slug, &name, genre, style, &premise)?)
}

/// Builds the project's pipeline and runs it to completion.
pub async fn write_movie(
    config: &Config,
    project: Project,
    service: Arc<dyn ReasoningService>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    sink: &dyn EventSink,
    cancel: &CancelSignal,
) -> Result<(Pipeline, PipelineOutcome), GenerationError> {
    let mut pipeline = PipelineBuilder::new(config.scripts_root()).build(project)?;
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let registry = CapabilityRegistry::for_project(
        pipeline.project_dir(),
        storage.clone(),
        fetcher,
        pipeline.project().visual_style(),
    );

    let executor = PipelineExecutor::new(service, registry, storage, &config.pipeline);
    let outcome = executor.execute(&mut pipeline, sink, cancel).await?;
    Ok((pipeline, outcome))
}

/// Writes the fixed sample image. The extension follows what the backend returns.
pub async fn generate_sample_image(
    fetcher: &dyn ImageFetcher,
    dir: &Path,
) -> Result<PathBuf, GenerationError> {
    let request = ImageRequest::default();
    let format = fetcher.produced_format(request.output_format);
    let output = dir.join(format!("{}.{}", SAMPLE_IMAGE_STEM, format.as_str()));
    fetcher.fetch(&request, &output).await?;
    Ok(output)
}

/// Markdown table of the steps: order, performer, title and output file.
pub fn step_table(pipeline: &Pipeline) -> String {
    let mut lines = vec![
        "| # | Role | Step | Output |".to_string(),
        "|---|------|------|--------|".to_string(),
    ];
    for (index, step) in pipeline.steps().iter().enumerate() {
        let file = step
            .output_path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        lines.push(format!(
            "| {} | {} | {} | {} |",
            index + 1,
            step.role.name,
            step.title,
            file
        ));
    }
    lines.join("\n")
}

/// Interactive entry point. Unattended mode takes the project from config.
pub async fn run(
    config: &Config,
    service: Arc<dyn ReasoningService>,
    fetcher: Arc<dyn ImageFetcher>,
    cancel: &CancelSignal,
) -> Result<()> {
    let (action, project) = if config.unattended {
        let project_cfg = config
            .project
            .as_ref()
            .ok_or_else(|| anyhow!("unattended mode requires a 'project' section"))?;
        (Action::WriteMovie, Some(Project::try_from(project_cfg)?))
    } else {
        (choose_action()?, None)
    };

    if action == Action::GenerateSampleImage {
        let path = generate_sample_image(fetcher.as_ref(), &config.scripts_root()).await?;
        println!("Sample image written to {}", path.display());
        return Ok(());
    }

    let project = match project {
        Some(project) => project,
        None => prompt_project()?,
    };
    println!("Writing \"{}\" ({}, {})", project.name(), project.genre(), project.visual_style());

    let started = Instant::now();
    let sink = ProgressSink::new()?;
    let result = write_movie(config, project, service, Some(fetcher), &sink, cancel).await;
    let elapsed = started.elapsed();

    let (pipeline, outcome) = match result {
        Ok(done) => {
            sink.finish("Movie complete");
            done
        }
        Err(e) => {
            sink.finish("Stopped");
            println!("Total Time Elapsed: {:.2} seconds", elapsed.as_secs_f64());
            return Err(e.into());
        }
    };

    println!("Total Time Elapsed: {:.2} seconds", elapsed.as_secs_f64());
    println!("\nTasks:\n{}", step_table(&pipeline));
    println!("\nResults ({}):\n{}", outcome.final_step, outcome.final_text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::agent::DelegationRequest;
    use crate::services::image::OutputFormat;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoService;

    #[async_trait]
    impl ReasoningService for EchoService {
        async fn resolve(&self, request: DelegationRequest<'_>) -> Result<String> {
            Ok(format!("{}: ok", request.role.name))
        }
    }

    #[derive(Debug, Default)]
    struct FileFetcher {
        png_only: bool,
        requests: Mutex<Vec<ImageRequest>>,
    }

    #[async_trait]
    impl ImageFetcher for FileFetcher {
        fn produced_format(&self, requested: OutputFormat) -> OutputFormat {
            if self.png_only {
                OutputFormat::Png
            } else {
                requested
            }
        }

        async fn fetch(&self, request: &ImageRequest, output_path: &Path) -> Result<(), GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            std::fs::write(output_path, b"jpeg")?;
            Ok(())
        }
    }

    fn test_config(root: &Path) -> Result<Config> {
        let mut config = Config::from_yaml("llm:\n  provider: ollama\n")?;
        config.scripts_folder = root.to_string_lossy().to_string();
        Ok(config)
    }

    #[tokio::test]
    async fn test_write_movie_end_to_end() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let config = test_config(temp_dir.path())?;
        let project = Project::new("demo", "Demo", Genre::Comedy, VisualStyle::Cartoon, "two rival chefs")?;
        let sink = ProgressSink::hidden();

        let (pipeline, outcome) = write_movie(
            &config,
            project,
            Arc::new(EchoService),
            Some(Arc::new(FileFetcher::default())),
            &sink,
            &CancelSignal::never(),
        )
        .await?;

        assert_eq!(sink.position(), 12);
        assert_eq!(outcome.final_text, "Director: ok");
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("demo/first_act_draft.md"))?,
            "Screenwriter: ok"
        );
        let written = std::fs::read_dir(temp_dir.path().join("demo"))?.count();
        assert_eq!(written, pipeline.steps().len());
        Ok(())
    }

    #[tokio::test]
    async fn test_sample_image_uses_default_request() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let fetcher = FileFetcher::default();

        let path = generate_sample_image(&fetcher, temp_dir.path()).await?;

        assert_eq!(path, temp_dir.path().join("dog-wearing-glasses.jpeg"));
        assert!(path.exists());
        assert_eq!(fetcher.requests.lock().unwrap()[0], ImageRequest::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_sample_image_extension_follows_backend() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let fetcher = FileFetcher {
            png_only: true,
            ..FileFetcher::default()
        };

        let path = generate_sample_image(&fetcher, temp_dir.path()).await?;

        assert_eq!(path, temp_dir.path().join("dog-wearing-glasses.png"));
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_step_table_lists_every_step() -> Result<()> {
        let pipeline = PipelineBuilder::new("scripts").build(default_project()?)?;
        let table = step_table(&pipeline);
        assert_eq!(table.lines().count(), 2 + 12);
        assert!(table.contains("| 3 | Cinematographer | visual lookbook | lookbook.md |"));
        Ok(())
    }

    #[test]
    fn test_default_project_matches_prompt_defaults() -> Result<()> {
        let project = default_project()?;
        assert_eq!(project.id(), "little_bean");
        assert_eq!(project.genre(), Genre::Comedy);
        assert_eq!(project.visual_style(), VisualStyle::Cartoon);
        assert_eq!(Genre::ALL[1], Genre::Comedy);
        assert_eq!(VisualStyle::ALL[1], VisualStyle::Cartoon);
        Ok(())
    }
}
