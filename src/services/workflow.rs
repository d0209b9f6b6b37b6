use anyhow::anyhow;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::core::error::GenerationError;
use crate::core::io::Storage;
use crate::services::agent::{ContextEntry, DelegationRequest, ReasoningService};
use crate::services::capability::{Capability, CapabilityRegistry};
use crate::services::pipeline::{ContentStep, Pipeline, StepResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Per-step deadline. 0 disables it.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,
    /// Reuse non-empty artifacts already on disk instead of regenerating them.
    #[serde(default)]
    pub resume: bool,
}

fn default_step_timeout() -> u64 {
    900
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
            resume: false,
        }
    }
}

impl PipelineConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_seconds > 0).then(|| Duration::from_secs(self.step_timeout_seconds))
    }
}

/// Progress notifications emitted while a pipeline runs.
pub trait EventSink: Send + Sync {
    fn step_started(&self, index: usize, total: usize, step: &ContentStep);
    fn step_finished(&self, index: usize, total: usize, result: &StepResult, reused: bool);
    fn log_line(&self, line: &str);
}

/// Reports progress through the `log` facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn step_started(&self, index: usize, total: usize, step: &ContentStep) {
        info!(
            "[{}/{}] {} is working on the {}",
            index + 1,
            total,
            step.role.name,
            step.title
        );
    }

    fn step_finished(&self, index: usize, total: usize, result: &StepResult, reused: bool) {
        let action = if reused { "Reused" } else { "Wrote" };
        info!(
            "[{}/{}] {} {} ({} chars)",
            index + 1,
            total,
            action,
            result.path.display(),
            result.text.len()
        );
    }

    fn log_line(&self, line: &str) {
        info!("{}", line);
    }
}

/// Requests cancellation of a running pipeline.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by the executor between and during steps.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested. Pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Result of a complete run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub final_step: String,
    pub final_text: String,
    /// Output locations in step order.
    pub artifacts: Vec<PathBuf>,
}

/// Resolves the steps of a pipeline one at a time, in declared order.
pub struct PipelineExecutor {
    service: Arc<dyn ReasoningService>,
    registry: CapabilityRegistry,
    storage: Arc<dyn Storage>,
    step_timeout: Option<Duration>,
    resume: bool,
}

impl PipelineExecutor {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        registry: CapabilityRegistry,
        storage: Arc<dyn Storage>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            service,
            registry,
            storage,
            step_timeout: config.step_timeout(),
            resume: config.resume,
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub async fn execute(
        &self,
        pipeline: &mut Pipeline,
        sink: &dyn EventSink,
        cancel: &CancelSignal,
    ) -> Result<PipelineOutcome, GenerationError> {
        let total = pipeline.steps().len();
        if total == 0 {
            return Err(GenerationError::InvalidPipeline("pipeline has no steps".to_string()));
        }

        // Every declared capability must be wired before the first step runs.
        let capabilities = pipeline
            .steps()
            .iter()
            .map(|step| self.registry.resolve(&step.capabilities))
            .collect::<Result<Vec<_>, _>>()?;

        sink.log_line(&format!(
            "Writing \"{}\" into {}",
            pipeline.project().name(),
            pipeline.project_dir().display()
        ));

        for index in 0..total {
            let step = pipeline.steps()[index].clone();
            if pipeline.result(&step.id).is_some() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled { step: step.id });
            }

            sink.step_started(index, total, &step);

            let (text, reused) = match self.load_existing(&step).await? {
                Some(text) => {
                    sink.log_line(&format!("Reusing {}", step.output_path.display()));
                    (text, true)
                }
                None => {
                    let text = self
                        .delegate(pipeline, &step, &capabilities[index], sink, cancel)
                        .await?;
                    self.storage
                        .write(&step.output_path, text.as_bytes())
                        .await
                        .map_err(|e| GenerationError::step_resolution(&step.id, e))?;
                    (text, false)
                }
            };

            let result = StepResult {
                step_id: step.id.clone(),
                text,
                path: step.output_path.clone(),
            };
            sink.step_finished(index, total, &result, reused);
            pipeline.record(result)?;
        }

        let last = pipeline
            .results()
            .last()
            .map(|(_, result)| result)
            .ok_or_else(|| GenerationError::InvalidPipeline("no step was resolved".to_string()))?;

        Ok(PipelineOutcome {
            final_step: last.step_id.clone(),
            final_text: last.text.clone(),
            artifacts: pipeline.steps().iter().map(|s| s.output_path.clone()).collect(),
        })
    }

    async fn load_existing(&self, step: &ContentStep) -> Result<Option<String>, GenerationError> {
        if !self.resume {
            return Ok(None);
        }
        let path = &step.output_path;
        let exists = self
            .storage
            .exists(path)
            .await
            .map_err(|e| GenerationError::step_resolution(&step.id, e))?;
        if !exists {
            return Ok(None);
        }

        let text = self
            .storage
            .read_to_string(path)
            .await
            .map_err(|e| GenerationError::step_resolution(&step.id, e))?;
        if text.trim().is_empty() {
            warn!("{} is empty, regenerating", path.display());
            return Ok(None);
        }
        Ok(Some(text))
    }

    async fn delegate(
        &self,
        pipeline: &Pipeline,
        step: &ContentStep,
        capabilities: &[Arc<dyn Capability>],
        sink: &dyn EventSink,
        cancel: &CancelSignal,
    ) -> Result<String, GenerationError> {
        let context = step
            .dependencies
            .iter()
            .map(|dep| {
                let upstream = pipeline.step(dep).zip(pipeline.result(dep)).ok_or_else(|| {
                    GenerationError::InvalidPipeline(format!(
                        "'{}' needs '{}', which has not been resolved",
                        step.id, dep
                    ))
                })?;
                Ok(ContextEntry {
                    step_id: dep.clone(),
                    title: upstream.0.title.clone(),
                    text: upstream.1.text.clone(),
                })
            })
            .collect::<Result<Vec<_>, GenerationError>>()?;

        let work = self.service.resolve(DelegationRequest {
            step_id: &step.id,
            role: &step.role,
            instruction: &step.instruction,
            expected_output: &step.expected_output,
            context: &context,
            capabilities,
            events: sink,
        });
        let deadline = self.step_timeout;
        let bounded = async move {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("no answer within {:?}", limit))),
                None => work.await,
            }
        };

        let text = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(GenerationError::Cancelled { step: step.id.clone() });
            }
            result = bounded => result.map_err(|e| GenerationError::step_resolution(&step.id, e))?,
        };

        if text.trim().is_empty() {
            return Err(GenerationError::step_resolution(
                &step.id,
                anyhow!("reasoning service returned no text"),
            ));
        }
        Ok(text)
    }
}
