use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent_engine::event_bus::{EventBus, RunEvent};
use crate::agent_engine::history::HistoryWindow;
use crate::agent_engine::loop_control::{run_stage, LoopConfig, LoopController, PauseGate, RetryPolicy, Stage};
use crate::agent_engine::prompt::build_system_prompt;
use crate::agent_engine::state::{sentinel, ParsedAction, RunSnapshot, RunStatus, Turn, TurnTiming};
use crate::errors::{ErrorCode, PilotError, PilotResult, RunError};
use crate::executor::dispatcher::{ExecuteParams, Operator};
use crate::llm::action_parser::strip_reflection;
use crate::llm::provider::{InvokeParams, VisionModel};
use crate::perception::types::ScreenContext;

const DEFAULT_LANGUAGE: &str = "English";

/// Cloneable remote control for a [`GuiAgent`], usable from any task.
#[derive(Clone)]
pub struct AgentHandle {
    cancel: CancellationToken,
    pause: PauseGate,
}

impl AgentHandle {
    pub fn pause(&self) {
        tracing::info!("pause requested");
        self.pause.pause();
    }

    pub fn resume(&self) {
        tracing::info!("resume requested");
        self.pause.resume();
    }

    /// Abort the current run. In-flight screenshot, model and execute calls
    /// are interrupted and the run ends in `UserStopped`.
    pub fn stop(&self) {
        tracing::info!("stop requested");
        self.cancel.cancel();
    }
}

/// Vision-driven action loop: screenshot, predict, execute, repeat.
pub struct GuiAgent {
    operator: Arc<dyn Operator>,
    model: Arc<dyn VisionModel>,
    config: LoopConfig,
    system_prompt: Option<String>,
    language: String,
    cancel: CancellationToken,
    pause: PauseGate,
    events: EventBus,
}

/// Mutable state of one `run` call.
struct Run {
    run_id: uuid::Uuid,
    instruction: String,
    status: RunStatus,
    started_at: chrono::DateTime<chrono::Utc>,
    controller: LoopController,
    history: HistoryWindow,
    /// Turns appended since the last data event.
    pending: Vec<Turn>,
    last_context: Option<ScreenContext>,
    /// Stage whose failure is being propagated, if any.
    stage: Option<Stage>,
    error: Option<RunError>,
}

impl Run {
    fn new(instruction: &str, config: &LoopConfig) -> Self {
        let mut history = HistoryWindow::new(config.max_image_length);
        history.push(Turn::instruction(instruction));
        Self {
            run_id: uuid::Uuid::new_v4(),
            instruction: instruction.to_string(),
            status: RunStatus::Init,
            started_at: chrono::Utc::now(),
            controller: LoopController::new(config.max_loop_count),
            history,
            pending: Vec::new(),
            last_context: None,
            stage: None,
            error: None,
        }
    }

    fn append(&mut self, turn: Turn) {
        self.pending.push(turn.clone());
        self.history.push(turn);
    }

    fn set_status(&mut self, status: RunStatus) {
        if self.status != status {
            tracing::info!(from = ?self.status, to = ?status, loop_count = self.controller.loop_count(), "run status changed");
            self.status = status;
        }
    }

    /// Snapshot carrying the turns not yet emitted.
    fn take_snapshot(&mut self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            instruction: self.instruction.clone(),
            status: self.status,
            loop_count: self.controller.loop_count(),
            turns: std::mem::take(&mut self.pending),
            started_at: self.started_at,
        }
    }
}

fn stage_error_code(stage: Stage) -> ErrorCode {
    match stage {
        Stage::Screenshot => ErrorCode::ScreenshotFailure,
        Stage::Model => ErrorCode::ModelFailure,
        Stage::Execute => ErrorCode::ExecutionError,
    }
}

impl GuiAgent {
    pub fn new(operator: Arc<dyn Operator>, model: Arc<dyn VisionModel>, config: LoopConfig) -> Self {
        Self {
            operator,
            model,
            config,
            system_prompt: None,
            language: DEFAULT_LANGUAGE.to_string(),
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
            events: EventBus::default(),
        }
    }

    /// Replace the prompt derived from the operator's action space.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_sink(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            cancel: self.cancel.clone(),
            pause: self.pause.clone(),
        }
    }

    pub fn pause(&self) {
        self.handle().pause();
    }

    pub fn resume(&self) {
        self.handle().resume();
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn system_prompt(&self) -> String {
        match &self.system_prompt {
            Some(prompt) => prompt.clone(),
            None => build_system_prompt(&self.operator.action_spaces(), &self.language),
        }
    }

    /// Drive the loop for `instruction` until a terminal status.
    ///
    /// Returns `Ok` with the terminal status for every normal ending,
    /// including `Error` raised by the environment sentinel. Exhausted stage
    /// retries and unexpected failures return `Err` after the status has been
    /// set to `Error` and the final and error events have been emitted.
    pub async fn run(&self, instruction: &str) -> PilotResult<RunStatus> {
        let mut run = Run::new(instruction, &self.config);
        let span = tracing::info_span!("run", run_id = %run.run_id, model = self.model.name());
        self.run_to_end(&mut run).instrument(span).await
    }

    async fn run_to_end(&self, run: &mut Run) -> PilotResult<RunStatus> {
        tracing::info!(instruction = %run.instruction, max_loop_count = self.config.max_loop_count, "run started");
        run.set_status(RunStatus::Running);
        self.emit_data(run);

        let result = match self.drive(run).await {
            Ok(()) => Ok(run.status),
            Err(err) if err.is_cancelled() => {
                run.set_status(RunStatus::UserStopped);
                Ok(RunStatus::UserStopped)
            }
            Err(err) => {
                tracing::error!(stage = ?run.stage, error = %err, "run failed");
                let mut run_error = RunError::from(&err);
                if let Some(stage) = run.stage {
                    run_error.code = stage_error_code(stage);
                }
                run.error = Some(run_error);
                run.set_status(RunStatus::Error);
                Err(err)
            }
        };

        if run.status == RunStatus::UserStopped {
            self.release_on_stop(run).await;
        }

        self.emit_data(run);
        if run.status == RunStatus::Error {
            let error = run
                .error
                .take()
                .unwrap_or_else(|| RunError::new(ErrorCode::ExecutionError, "operator reported an error status"));
            let snapshot = run.take_snapshot();
            self.events.emit(RunEvent::Error(snapshot, error));
        }

        tracing::info!(status = ?run.status, loop_count = run.controller.loop_count(), "run finished");
        result
    }

    async fn drive(&self, run: &mut Run) -> PilotResult<()> {
        let system_prompt = self.system_prompt();

        loop {
            if self.pause.is_paused() && run.status.is_alive() {
                run.set_status(RunStatus::Paused);
                self.emit_data(run);
                if !self.pause.wait_resumed(&self.cancel).await {
                    run.set_status(RunStatus::UserStopped);
                    break;
                }
                run.set_status(RunStatus::Running);
                self.emit_data(run);
            }

            if !run.status.is_alive() {
                break;
            }
            if self.cancel.is_cancelled() {
                run.set_status(RunStatus::UserStopped);
                break;
            }
            if let Some(status) = run.controller.should_stop() {
                tracing::info!(
                    loop_count = run.controller.loop_count(),
                    invalid_screenshots = run.controller.invalid_screenshots(),
                    "loop budget spent"
                );
                run.set_status(status);
                break;
            }

            let shot_start = chrono::Utc::now();
            run.stage = Some(Stage::Screenshot);
            let shot = run_stage(Stage::Screenshot, self.retry(Stage::Screenshot), &self.cancel, || self.operator.screenshot()).await?;
            run.stage = None;

            if !shot.is_valid() {
                run.controller.record_invalid_screenshot();
                tracing::warn!(
                    invalid_screenshots = run.controller.invalid_screenshots(),
                    width = shot.width,
                    height = shot.height,
                    "invalid screenshot"
                );
                self.sleep(self.config.invalid_screenshot_backoff).await;
                continue;
            }

            if self.cancel.is_cancelled() {
                run.set_status(RunStatus::UserStopped);
                break;
            }
            run.controller.record_iteration();

            let context = shot.context();
            run.last_context = Some(context);
            run.append(Turn::screenshot(shot.base64, context, TurnTiming::since(shot_start)));
            self.emit_data(run);

            let model_start = chrono::Utc::now();
            run.stage = Some(Stage::Model);
            let output = {
                let params = InvokeParams {
                    system_prompt: &system_prompt,
                    conversation: run.history.conversation(),
                    images: run.history.images(),
                    screen_context: context,
                    scale_factor: context.scale_factor,
                };
                run_stage(Stage::Model, self.retry(Stage::Model), &self.cancel, || self.model.invoke(params, &self.cancel)).await?
            };
            run.stage = None;

            if output.prediction.trim().is_empty() {
                tracing::warn!(loop_count = run.controller.loop_count(), "empty prediction, nothing to execute");
                continue;
            }

            let mut timing = TurnTiming::since(model_start);
            if let Some(ms) = output.cost_time_ms {
                timing.cost_ms = ms;
            }
            timing.cost_tokens = output.cost_tokens;
            tracing::info!(
                loop_count = run.controller.loop_count(),
                actions = output.parsed_actions.len(),
                cost_ms = timing.cost_ms,
                cost_tokens = ?timing.cost_tokens,
                "prediction received"
            );
            run.append(Turn::prediction(
                strip_reflection(&output.prediction),
                output.parsed_actions.clone(),
                timing,
            ));
            self.emit_data(run);

            self.dispatch_actions(run, &output.parsed_actions, context).await?;
            if !run.status.is_alive() {
                break;
            }

            self.sleep(self.config.loop_interval).await;
        }

        Ok(())
    }

    async fn dispatch_actions(&self, run: &mut Run, actions: &[ParsedAction], context: ScreenContext) -> PilotResult<()> {
        for action in actions {
            if action.is(sentinel::ERROR_ENV) {
                let message = action
                    .input("content")
                    .filter(|c| !c.is_empty())
                    .unwrap_or("environment reported an error")
                    .to_string();
                tracing::error!(%message, "environment error reported by model");
                run.error = Some(RunError::from(&PilotError::Environment(message)));
                run.set_status(RunStatus::Error);
                break;
            }
            if action.is(sentinel::MAX_LOOP) {
                run.set_status(RunStatus::MaxLoop);
                break;
            }

            if !self.cancel.is_cancelled() {
                let params = ExecuteParams {
                    action,
                    screen_width: context.width,
                    screen_height: context.height,
                    scale_factor: context.scale_factor,
                    factors: self.config.factors,
                };
                run.stage = Some(Stage::Execute);
                let output = run_stage(Stage::Execute, self.retry(Stage::Execute), &self.cancel, || {
                    self.operator.execute(params)
                })
                .await?;
                run.stage = None;

                if let Some(status) = output.status {
                    tracing::info!(action_type = %action.action_type, ?status, "operator set run status");
                    run.set_status(status);
                    if status.is_terminal() {
                        break;
                    }
                }
            }

            if action.is(sentinel::FINISHED) {
                run.set_status(RunStatus::End);
                break;
            }
            if action.is(sentinel::CALL_USER) {
                run.set_status(RunStatus::CallUser);
                break;
            }
        }
        Ok(())
    }

    /// Single best-effort `user_stop` so the operator can release held input.
    async fn release_on_stop(&self, run: &Run) {
        let context = run.last_context.unwrap_or(ScreenContext {
            width: 0,
            height: 0,
            scale_factor: 1.0,
        });
        let action = ParsedAction::new(sentinel::USER_STOP);
        let params = ExecuteParams {
            action: &action,
            screen_width: context.width,
            screen_height: context.height,
            scale_factor: context.scale_factor,
            factors: self.config.factors,
        };
        if let Err(err) = self.operator.execute(params).await {
            tracing::warn!(error = %err, "user_stop execute failed");
        }
    }

    fn retry(&self, stage: Stage) -> &RetryPolicy {
        self.config.retry.for_stage(stage)
    }

    fn emit_data(&self, run: &mut Run) {
        let snapshot = run.take_snapshot();
        self.events.emit(RunEvent::Data(snapshot));
    }

    /// Sleep unless cancelled first.
    async fn sleep(&self, duration: std::time::Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
