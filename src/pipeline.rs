use crate::error::AppError;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{error, info};

#[async_trait]
pub trait PipelineStep<C: Send>: Send + Sync {
    fn name(&self) -> String;

    async fn run(&self, ctx: &mut C) -> Result<(), AppError>;
}

/// Ordered steps over a shared context. The first failing step stops the
/// run; whatever earlier steps produced stays in the context.
pub struct Pipeline<C> {
    label: &'static str,
    steps: Vec<Box<dyn PipelineStep<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl PipelineStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut C) -> Result<(), AppError> {
        let started = Instant::now();
        for step in &self.steps {
            let name = step.name();
            if let Err(err) = step.run(ctx).await {
                error!(pipeline = self.label, step = %name, error = %err, "pipeline step failed");
                return Err(err);
            }
            info!(pipeline = self.label, step = %name, "pipeline step finished");
        }
        info!(
            pipeline = self.label,
            steps = self.steps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline complete"
        );
        Ok(())
    }
}
