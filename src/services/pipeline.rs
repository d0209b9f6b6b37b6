//! The movie pipeline: a project, its fixed sequence of content steps and
//! the results accumulated while the steps are resolved.
//!
//! Dependencies always point backwards in the sequence, so resolving the
//! steps in declared order is enough; no topological sort is involved.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::error::GenerationError;
use crate::utils::text::is_safe_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Genre {
    Action,
    Comedy,
    Drama,
    #[serde(rename = "Sci-Fi")]
    SciFi,
}

impl Genre {
    pub const ALL: [Genre; 4] = [Genre::Action, Genre::Comedy, Genre::Drama, Genre::SciFi];
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Genre::Action => "Action",
            Genre::Comedy => "Comedy",
            Genre::Drama => "Drama",
            Genre::SciFi => "Sci-Fi",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisualStyle {
    Realistic,
    Cartoon,
    Anime,
    Pixar,
    Gritty,
}

impl VisualStyle {
    pub const ALL: [VisualStyle; 5] = [
        VisualStyle::Realistic,
        VisualStyle::Cartoon,
        VisualStyle::Anime,
        VisualStyle::Pixar,
        VisualStyle::Gritty,
    ];

    /// Tonal keywords repeated in every image prompt of the project.
    pub fn tonal_prompt(&self) -> &'static str {
        match self {
            VisualStyle::Realistic => "realistic, live action, cinematic photography",
            VisualStyle::Cartoon => "2d cartoon, bold outlines, vibrant colors",
            VisualStyle::Anime => "anime, cel shaded, japanese animation",
            VisualStyle::Pixar => "pixar, 3d animated, cartoon",
            VisualStyle::Gritty => "realistic, gritty, 2d animated, desaturated",
        }
    }
}

impl fmt::Display for VisualStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Project parameters as they appear in `config.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,
    pub genre: Genre,
    pub visual_style: VisualStyle,
    pub premise: String,
}

/// One movie. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    id: String,
    name: String,
    genre: Genre,
    visual_style: VisualStyle,
    premise: String,
}

impl Project {
    pub fn new(
        id: &str,
        name: &str,
        genre: Genre,
        visual_style: VisualStyle,
        premise: &str,
    ) -> Result<Self, GenerationError> {
        if !is_safe_identifier(id) {
            return Err(GenerationError::Configuration(format!(
                "project id '{}' must use lowercase letters, digits, '_' or '-'",
                id
            )));
        }
        if premise.trim().is_empty() {
            return Err(GenerationError::Configuration(
                "project premise must not be empty".to_string(),
            ));
        }
        let name = if name.trim().is_empty() { id } else { name.trim() };

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            genre,
            visual_style,
            premise: premise.trim().to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn genre(&self) -> Genre {
        self.genre
    }

    pub fn visual_style(&self) -> VisualStyle {
        self.visual_style
    }

    pub fn premise(&self) -> &str {
        &self.premise
    }
}

impl TryFrom<&ProjectConfig> for Project {
    type Error = GenerationError;

    fn try_from(cfg: &ProjectConfig) -> Result<Self, Self::Error> {
        Project::new(&cfg.id, &cfg.name, cfg.genre, cfg.visual_style, &cfg.premise)
    }
}

/// The persona that performs a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub goal: String,
    pub backstory: String,
}

impl Role {
    pub fn screenwriter(project: &Project) -> Self {
        Self {
            name: "Screenwriter".to_string(),
            goal: format!(
                "Establish the premise and setting of \"{}\", write its dialog, and keep the story true to the original idea.",
                project.name
            ),
            backstory: format!(
                "You are the writer of \"{}\" and a master of the {} genre. Your inspirations are Shakespeare and Quentin Tarantino.",
                project.name, project.genre
            ),
        }
    }

    pub fn cinematographer(project: &Project) -> Self {
        Self {
            name: "Cinematographer".to_string(),
            goal: format!(
                "Define the look and feel of \"{}\" from the screenwriter's treatment.",
                project.name
            ),
            backstory: format!(
                "You are the cinematographer of \"{}\". Your inspirations are Roger Deakins and Emmanuel Lubezki.",
                project.name
            ),
        }
    }

    pub fn director(project: &Project) -> Self {
        Self {
            name: "Director".to_string(),
            goal: format!(
                "Turn the script of \"{}\" into storyboards and plan its shots and angles.",
                project.name
            ),
            backstory: format!(
                "You are the director of \"{}\". Your inspirations are Steven Spielberg and Alfred Hitchcock.",
                project.name
            ),
        }
    }
}

/// Named operations a step may invoke while it is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    ListDirectory,
    ReadFile,
    GenerateImage,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::ListDirectory => "list_directory",
            CapabilityKind::ReadFile => "read_file",
            CapabilityKind::GenerateImage => "generate_image",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentStep {
    pub id: String,
    pub title: String,
    pub role: Role,
    pub instruction: String,
    /// Natural-language contract for the answer. Not machine-checked.
    pub expected_output: String,
    pub output_path: PathBuf,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<CapabilityKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub text: String,
    pub path: PathBuf,
}

/// Steps of one project in declared order, plus the results recorded so far.
#[derive(Debug)]
pub struct Pipeline {
    project: Project,
    project_dir: PathBuf,
    steps: Vec<ContentStep>,
    results: IndexMap<String, StepResult>,
}

impl Pipeline {
    pub fn new(
        project: Project,
        project_dir: PathBuf,
        steps: Vec<ContentStep>,
    ) -> Result<Self, GenerationError> {
        validate_steps(&project_dir, &steps)?;
        Ok(Self {
            project,
            project_dir,
            steps,
            results: IndexMap::new(),
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn steps(&self) -> &[ContentStep] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&ContentStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn results(&self) -> &IndexMap<String, StepResult> {
        &self.results
    }

    pub fn result(&self, id: &str) -> Option<&StepResult> {
        self.results.get(id)
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() == self.steps.len()
    }

    pub fn output_paths(&self) -> Vec<&Path> {
        self.steps.iter().map(|s| s.output_path.as_path()).collect()
    }

    /// Stores the result of the next unresolved step. Anything else is rejected.
    pub(crate) fn record(&mut self, result: StepResult) -> Result<(), GenerationError> {
        let expected = self.steps.get(self.results.len()).ok_or_else(|| {
            GenerationError::InvalidPipeline(format!(
                "result for '{}' recorded after every step was resolved",
                result.step_id
            ))
        })?;
        if expected.id != result.step_id {
            return Err(GenerationError::InvalidPipeline(format!(
                "result for '{}' recorded while '{}' is next in order",
                result.step_id, expected.id
            )));
        }
        self.results.insert(result.step_id.clone(), result);
        Ok(())
    }
}

fn validate_steps(project_dir: &Path, steps: &[ContentStep]) -> Result<(), GenerationError> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut seen_paths: HashSet<&Path> = HashSet::new();

    for step in steps {
        if step.id.trim().is_empty() {
            return Err(GenerationError::InvalidPipeline("step with empty id".to_string()));
        }
        for dep in &step.dependencies {
            if !seen_ids.contains(dep.as_str()) {
                return Err(GenerationError::InvalidPipeline(format!(
                    "step '{}' depends on '{}', which is not an earlier step",
                    step.id, dep
                )));
            }
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(GenerationError::InvalidPipeline(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        if !step.output_path.starts_with(project_dir) || step.output_path == project_dir {
            return Err(GenerationError::InvalidPipeline(format!(
                "output of '{}' ({}) is outside the project directory",
                step.id,
                step.output_path.display()
            )));
        }
        if !seen_paths.insert(step.output_path.as_path()) {
            return Err(GenerationError::InvalidPipeline(format!(
                "step '{}' shares its output location {}",
                step.id,
                step.output_path.display()
            )));
        }
    }
    Ok(())
}

const ACTS: [(&str, &str); 3] = [
    ("first act", "first_act"),
    ("second act", "second_act"),
    ("third act", "third_act"),
];

const BASE_CAPABILITIES: [CapabilityKind; 2] =
    [CapabilityKind::ListDirectory, CapabilityKind::ReadFile];

/// Assembles the fixed twelve-step movie pipeline for a project.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    scripts_root: PathBuf,
}

impl PipelineBuilder {
    pub fn new(scripts_root: impl Into<PathBuf>) -> Self {
        Self {
            scripts_root: scripts_root.into(),
        }
    }

    pub fn project_dir(&self, project: &Project) -> PathBuf {
        self.scripts_root.join(project.id())
    }

    pub fn build(&self, project: Project) -> Result<Pipeline, GenerationError> {
        let dir = self.project_dir(&project);
        let p = &project;
        let screenwriter = Role::screenwriter(p);
        let cinematographer = Role::cinematographer(p);
        let director = Role::director(p);

        let mut steps = vec![
            ContentStep {
                id: "plot".to_string(),
                title: "plot definition".to_string(),
                role: screenwriter.clone(),
                instruction: format!(
                    "Establish the plot, setting, and characters for {}, in the {} genre. In brief, the main idea is: {}",
                    p.name, p.genre, p.premise
                ),
                expected_output: "A one-pager with the title, subtitle (if any), plot, setting, and characters for the movie.".to_string(),
                output_path: dir.join("idea_draft.md"),
                dependencies: vec![],
                capabilities: BASE_CAPABILITIES.to_vec(),
            },
            ContentStep {
                id: "treatment".to_string(),
                title: "treatment".to_string(),
                role: screenwriter.clone(),
                instruction: format!(
                    "Write a treatment for {} in the {} genre, based on the plot, setting, and characters given in the context. \
                     Be sure it remains true to the original idea: {}",
                    p.name, p.genre, p.premise
                ),
                expected_output: "A concise treatment for the movie, no more than 10 pages, including title, logline, characters and synopsis. \
                     Also include a detailed description of the art style, color scheme, etc.".to_string(),
                output_path: dir.join("treatment.md"),
                dependencies: vec!["plot".to_string()],
                capabilities: BASE_CAPABILITIES.to_vec(),
            },
            ContentStep {
                id: "lookbook".to_string(),
                title: "visual lookbook".to_string(),
                role: cinematographer,
                instruction: format!(
                    "Create a lookbook for the visual style of {} based on the treatment given in the context. \
                     Include color schemes, art style, and any other visual references that will help the cinematographer and director. \
                     In place of actual illustrations include extremely detailed visual descriptions. \
                     The visual style of the movie is {} ({}).",
                    p.name,
                    p.visual_style,
                    p.visual_style.tonal_prompt()
                ),
                expected_output: "A lookbook for the visual style of the movie.".to_string(),
                output_path: dir.join("lookbook.md"),
                dependencies: vec!["treatment".to_string()],
                capabilities: BASE_CAPABILITIES.to_vec(),
            },
        ];

        for (i, (ordinal, file_stem)) in ACTS.iter().enumerate() {
            let mut dependencies = vec!["treatment".to_string()];
            dependencies.extend((1..=i).map(|n| format!("act{}", n)));
            steps.push(ContentStep {
                id: format!("act{}", i + 1),
                title: format!("{} script", ordinal),
                role: screenwriter.clone(),
                instruction: format!(
                    "Write the {} script for {}, in the {} genre, based on the treatment given in the context. \
                     Keep continuity with any earlier acts included in the context.",
                    ordinal, p.name, p.genre
                ),
                expected_output: format!("The complete {} of the movie script.", ordinal),
                output_path: dir.join(format!("{}_draft.md", file_stem)),
                dependencies,
                capabilities: BASE_CAPABILITIES.to_vec(),
            });
        }

        for (i, (ordinal, file_stem)) in ACTS.iter().enumerate() {
            let mut dependencies = vec![format!("act{}", i + 1)];
            dependencies.extend((1..=i).map(|n| format!("storyboard{}", n)));
            steps.push(ContentStep {
                id: format!("storyboard{}", i + 1),
                title: format!("{} storyboard", ordinal),
                role: director.clone(),
                instruction: format!(
                    "Create a storyboard for the {} of {} based on its script in the context. \
                     Describe each scene in its own paragraph, as if describing the frames on the storyboard. \
                     Make the descriptions rich enough for our artists to paint the scenes, with angle, pose, and detailed character information.",
                    ordinal, p.name
                ),
                expected_output: format!("Storyboard for the {} of the movie.", ordinal),
                output_path: dir.join(format!("{}_storyboard_draft.md", file_stem)),
                dependencies,
                capabilities: BASE_CAPABILITIES.to_vec(),
            });
        }

        for (i, (ordinal, file_stem)) in ACTS.iter().enumerate() {
            let mut capabilities = BASE_CAPABILITIES.to_vec();
            capabilities.push(CapabilityKind::GenerateImage);
            steps.push(ContentStep {
                id: format!("illustrated{}", i + 1),
                title: format!("illustrated {} storyboard", ordinal),
                role: director.clone(),
                instruction: illustrated_instruction(p, ordinal),
                expected_output: format!(
                    "Storyboard for the {} of the movie in markdown format with shot title, description and full embedded image reference. \
                     Do NOT wrap it in a code block, and ALWAYS include the full image reference.",
                    ordinal
                ),
                output_path: dir.join(format!("{}_illustration.md", file_stem)),
                dependencies: vec![
                    "treatment".to_string(),
                    "lookbook".to_string(),
                    format!("storyboard{}", i + 1),
                ],
                capabilities,
            });
        }

        Pipeline::new(project, dir, steps)
    }
}

fn illustrated_instruction(p: &Project, ordinal: &str) -> String {
    let tone = p.visual_style.tonal_prompt();
    format!(
        "Create an illustrated storyboard for the {ordinal} of {name} based on its storyboard in the context. \
         Also consult the treatment and the lookbook in the context.\n\
         Include a detailed description of the visual style and each character that is as consistent as possible, \
         giving the world a consistent tone, color palette, and style across illustrations.\n\
         If a character is old, young, tall, short, has a certain hair or clothing style, then specify that in the description.\n\
         Always include these tonal keywords in every image prompt: \"{tone}\".\n\
         Include specific framing details like \"from above\" or \"close-up\".\n\
         Always include the character descriptions, like \"long brown hair, pale skin, pointed nose\", in every image prompt.\n\
         Clearly describe what is in the foreground, what is in the background, and any costumes or other details that are important.\n\
         Clearly describe the relationship between the characters, for example whether one is pointing at another, \
         or one is looking at another, or standing in front or behind the other.\n\
         Include an image for every scene in the storyboard. Do not skip any images.\n\
         Feed the entire scene description into the {tool} tool. Do not skip any details.\n\
         Use the image reference returned by the {tool} tool EXACTLY as it is, including any query parameters. \
         Do not truncate or modify it in any way.",
        ordinal = ordinal,
        name = p.name,
        tone = tone,
        tool = CapabilityKind::GenerateImage.as_str(),
    )
}
