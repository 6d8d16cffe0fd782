//! Multi-stage workflows built from function dispatches.
//!
//! Every accepted run executes on its own task. Stages run one after another;
//! a fan-out stage dispatches its items concurrently and collects the results
//! in item order before the next stage starts.

pub mod definitions;
pub mod runs;

use std::sync::Arc;

use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use self::{
    definitions::{StageDef, WorkflowDef},
    runs::{WorkflowRunInfo, WorkflowRuns, WorkflowStatus},
};
use self::definitions::StagePayloads;
use crate::{
    config::WorkflowConfig,
    dispatcher::{DispatchError, Dispatcher},
    metrics::Metrics,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow name {0}")]
    UnknownWorkflow(String),

    #[error("stage {stage} failed: {source}")]
    StageFailure {
        stage: String,
        #[source]
        source: DispatchError,
    },

    #[error("stage {stage} got malformed input: {message}")]
    MalformedStageOutput { stage: String, message: String },

    #[error("stage {stage} task aborted: {message}")]
    Aborted { stage: String, message: String },
}

impl WorkflowError {
    pub fn stage(&self) -> &str {
        match self {
            WorkflowError::UnknownWorkflow(_) => "",
            WorkflowError::StageFailure { stage, .. } |
            WorkflowError::MalformedStageOutput { stage, .. } |
            WorkflowError::Aborted { stage, .. } => stage,
        }
    }
}

/// Returned to the caller of [`WorkflowEngine::run_workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    id: String,
    status: watch::Receiver<WorkflowStatus>,
}

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub fn status(&self) -> WorkflowStatus {
        self.status.borrow().clone()
    }

    /// Wait for the run to succeed or fail.
    #[cfg(test)]
    pub async fn wait(&mut self) -> WorkflowStatus {
        let finished = self
            .status
            .wait_for(WorkflowStatus::is_finished)
            .await
            .map(|status| status.clone());
        finished.unwrap_or_else(|_| self.status.borrow().clone())
    }
}

/// State of one run, owned by its execution task.
pub struct WorkflowInstance {
    pub id: String,
    pub def: &'static WorkflowDef,
    pub base: Map<String, Value>,
    /// Output of every completed stage. A fan-out stage's output is the
    /// array of its item results.
    pub results: Vec<Value>,
}

impl WorkflowInstance {
    fn new(id: String, def: &'static WorkflowDef, payload: Value) -> Self {
        Self {
            id,
            def,
            base: definitions::base_payload(payload),
            results: Vec::with_capacity(def.stages.len()),
        }
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    dispatcher: Arc<Dispatcher>,
    runs: Arc<WorkflowRuns>,
    max_fan_out: Option<usize>,
    metrics: Arc<Metrics>,
}

impl WorkflowEngine {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &WorkflowConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            dispatcher,
            runs: Arc::new(WorkflowRuns::new(config.history_limit)),
            max_fan_out: config.max_fan_out_concurrency,
            metrics,
        }
    }

    pub fn runs(&self) -> &Arc<WorkflowRuns> {
        &self.runs
    }

    /// Start a run of the named workflow in the background.
    ///
    /// Unknown names are rejected before anything is spawned.
    pub fn run_workflow(&self, name: &str, payload: Value) -> Result<WorkflowHandle, WorkflowError> {
        let def = definitions::lookup(name)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let first_stage = def.stages.first().map(|s| s.name).unwrap_or_default();
        let (tx, rx) = watch::channel(WorkflowStatus::Running {
            stage: first_stage.to_string(),
            completed_stages: 0,
        });
        let handle = WorkflowHandle {
            id: id.clone(),
            status: rx,
        };
        self.runs.register(&id, def.name, handle.status.clone());

        let span = info_span!("workflow", workflow_id = %id, workflow = def.name);
        let instance = WorkflowInstance::new(id.clone(), def, payload);
        let engine = self.clone();
        tokio::spawn(engine.execute(instance, tx).instrument(span));
        info!(workflow_id = %id, workflow = def.name, "Workflow accepted");

        Ok(handle)
    }

    async fn execute(self, mut instance: WorkflowInstance, status: watch::Sender<WorkflowStatus>) {
        let outcome = match self.run_stages(&mut instance, &status).await {
            Ok(output) => {
                info!(stages = instance.results.len(), "Workflow succeeded");
                status.send_replace(WorkflowStatus::Succeeded { output });
                "succeeded"
            }
            Err(e) => {
                error!(stage = e.stage(), error = %e, "Workflow failed");
                status.send_replace(WorkflowStatus::Failed {
                    stage: e.stage().to_string(),
                    error: e.to_string(),
                });
                "failed"
            }
        };
        self.metrics.workflow_runs.add(
            1,
            &[
                KeyValue::new("workflow", instance.def.name),
                KeyValue::new("outcome", outcome),
            ],
        );
        self.runs.mark_finished(&instance.id);
    }

    async fn run_stages(
        &self,
        instance: &mut WorkflowInstance,
        status: &watch::Sender<WorkflowStatus>,
    ) -> Result<Value, WorkflowError> {
        for (index, stage) in instance.def.stages.iter().enumerate() {
            status.send_replace(WorkflowStatus::Running {
                stage: stage.name.to_string(),
                completed_stages: index,
            });
            let payloads = stage
                .input
                .payloads(&instance.base, instance.results.last())
                .map_err(|message| WorkflowError::MalformedStageOutput {
                    stage: stage.name.to_string(),
                    message,
                })?;

            let output = match payloads {
                StagePayloads::Single(payload) => self
                    .dispatcher
                    .dispatch(stage.function, &payload)
                    .await
                    .map(|outcome| outcome.body)
                    .map_err(|source| WorkflowError::StageFailure {
                        stage: stage.name.to_string(),
                        source,
                    })?,
                StagePayloads::FanOut(payloads) => {
                    Value::Array(self.fan_out(stage, payloads).await?)
                }
            };
            debug!(stage = stage.name, "Stage finished");
            instance.results.push(output);
        }
        Ok(instance.results.last().cloned().unwrap_or(Value::Null))
    }

    /// Dispatch every item concurrently. Slot `i` of the result holds the
    /// output for item `i`. All items run to completion even after a
    /// failure; the first failure to complete is returned.
    async fn fan_out(
        &self,
        stage: &StageDef,
        payloads: Vec<Value>,
    ) -> Result<Vec<Value>, WorkflowError> {
        let width = payloads.len();
        if width == 0 {
            return Ok(Vec::new());
        }
        let permits = self.max_fan_out.map_or(width, |max| max.clamp(1, width));
        let semaphore = Arc::new(Semaphore::new(permits));
        debug!(stage = stage.name, width, permits, "Fanning out");

        let mut tasks = JoinSet::new();
        for (index, payload) in payloads.into_iter().enumerate() {
            let dispatcher = self.dispatcher.clone();
            let semaphore = semaphore.clone();
            let function = stage.function;
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    (index, dispatcher.dispatch(function, &payload).await)
                }
                .in_current_span(),
            );
        }

        let mut slots: Vec<Option<Value>> = vec![None; width];
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => slots[index] = Some(outcome.body),
                Ok((index, Err(source))) => {
                    warn!(stage = stage.name, item_index = index, error = %source, "Fan-out item failed");
                    failure.get_or_insert(WorkflowError::StageFailure {
                        stage: stage.name.to_string(),
                        source,
                    });
                }
                Err(e) => {
                    failure.get_or_insert(WorkflowError::Aborted {
                        stage: stage.name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}
