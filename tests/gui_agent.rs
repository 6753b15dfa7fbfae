use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use screenpilot::agent_engine::loop_control::{LoopConfig, RetryPolicy};
use screenpilot::agent_engine::state::{ParsedAction, TurnPayload};
use screenpilot::errors::{ErrorCode, PilotError, PilotResult};
use screenpilot::executor::dispatcher::{ActionOutcome, ExecuteOutput, ExecuteParams, Operator};
use screenpilot::llm::provider::{InvokeOutput, InvokeParams, VisionModel};
use screenpilot::perception::types::ScreenshotResult;
use screenpilot::{AgentHandle, EventBus, GuiAgent, RunEvent, RunStatus};

fn frame() -> ScreenshotResult {
    ScreenshotResult {
        base64: "aGVsbG8=".into(),
        width: 1280,
        height: 720,
        scale_factor: 1.0,
    }
}

#[derive(Default)]
struct MockOperator {
    /// Frames handed out in order; once empty, valid frames are returned.
    frames: Mutex<VecDeque<PilotResult<ScreenshotResult>>>,
    always_fail: bool,
    /// Cancelled from inside the first screenshot call.
    cancel_on_screenshot: Option<CancellationToken>,
    /// Status reported back when this action type is executed.
    status_for: Option<(String, RunStatus)>,
    screenshots: Mutex<u32>,
    executed: Mutex<Vec<String>>,
}

impl MockOperator {
    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn screenshots(&self) -> u32 {
        *self.screenshots.lock().unwrap()
    }
}

#[async_trait]
impl Operator for MockOperator {
    fn action_spaces(&self) -> Vec<String> {
        vec!["click(start_box='')".into(), "finished(content='')".into()]
    }

    async fn screenshot(&self) -> PilotResult<ScreenshotResult> {
        *self.screenshots.lock().unwrap() += 1;
        if let Some(token) = &self.cancel_on_screenshot {
            token.cancel();
        }
        if self.always_fail {
            return Err(PilotError::Screenshot("display unavailable".into()));
        }
        self.frames.lock().unwrap().pop_front().unwrap_or_else(|| Ok(frame()))
    }

    async fn execute(&self, params: ExecuteParams<'_>) -> PilotResult<ExecuteOutput> {
        let action_type = params.action.action_type.clone();
        self.executed.lock().unwrap().push(action_type.clone());
        let status = self
            .status_for
            .as_ref()
            .filter(|(t, _)| *t == action_type)
            .map(|(_, s)| *s);
        Ok(ExecuteOutput {
            status,
            outcome: ActionOutcome::Performed,
        })
    }
}

#[derive(Default)]
struct MockModel {
    /// Scripted replies; once empty, every call answers `wait()`.
    replies: Mutex<VecDeque<InvokeOutput>>,
    /// Block until cancelled instead of answering.
    hang: bool,
    /// Paused from inside the first call, so the gate is seen mid-run.
    pause_on_first_call: Mutex<Option<AgentHandle>>,
    calls: Mutex<u32>,
    image_counts: Mutex<Vec<usize>>,
}

impl MockModel {
    fn scripted(replies: Vec<InvokeOutput>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl VisionModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, params: InvokeParams<'_>, cancel: &CancellationToken) -> PilotResult<InvokeOutput> {
        *self.calls.lock().unwrap() += 1;
        if let Some(handle) = self.pause_on_first_call.lock().unwrap().take() {
            handle.pause();
        }
        self.image_counts.lock().unwrap().push(params.images.len());
        assert_eq!(
            params.images.len(),
            params.conversation.iter().filter(|t| t.is_image()).count()
        );
        if self.hang {
            cancel.cancelled().await;
            return Err(PilotError::Cancelled);
        }
        let reply = self.replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| reply_with("Thought: wait\nAction: wait()", &["wait"])))
    }
}

fn reply_with(prediction: &str, actions: &[&str]) -> InvokeOutput {
    InvokeOutput {
        prediction: prediction.into(),
        parsed_actions: actions.iter().map(|a| ParsedAction::new(*a)).collect(),
        cost_time_ms: Some(12),
        cost_tokens: Some(345),
    }
}

fn finished() -> InvokeOutput {
    reply_with("Thought: all done\nAction: finished(content='ok')", &["finished"])
}

fn fast_config() -> LoopConfig {
    LoopConfig {
        invalid_screenshot_backoff: Duration::ZERO,
        ..LoopConfig::default()
    }
}

fn agent(operator: &Arc<MockOperator>, model: &Arc<MockModel>, config: LoopConfig) -> (GuiAgent, UnboundedReceiver<RunEvent>) {
    let (events, rx) = EventBus::channel();
    let agent = GuiAgent::new(operator.clone(), model.clone(), config).with_event_sink(events);
    (agent, rx)
}

fn drain(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn last_data_status(events: &[RunEvent]) -> RunStatus {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            RunEvent::Data(s) => Some(s.status),
            RunEvent::Error(..) => None,
        })
        .unwrap()
}

#[tokio::test]
async fn finished_ends_after_one_iteration() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![finished()]));
    let (agent, mut rx) = agent(&operator, &model, fast_config());

    let status = agent.run("close the dialog").await.unwrap();

    assert_eq!(status, RunStatus::End);
    assert_eq!(model.calls(), 1);
    assert_eq!(operator.executed(), vec!["finished"]);
    let events = drain(&mut rx);
    assert_eq!(last_data_status(&events), RunStatus::End);
    assert_eq!(events.last().unwrap().snapshot().loop_count, 1);
}

#[tokio::test]
async fn event_sequence_for_a_single_iteration() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![finished()]));
    let (agent, mut rx) = agent(&operator, &model, fast_config());
    agent.run("close the dialog").await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 4);
    let run_id = events[0].snapshot().run_id;
    assert!(events.iter().all(|e| e.snapshot().run_id == run_id));

    let first = events[0].snapshot();
    assert_eq!(first.status, RunStatus::Running);
    assert!(first.turns.is_empty());

    let shot = events[1].snapshot();
    assert_eq!(shot.turns.len(), 1);
    assert!(shot.turns[0].is_image());

    let prediction = events[2].snapshot();
    match &prediction.turns[0].payload {
        TurnPayload::Prediction { summary, actions } => {
            assert!(summary.contains("finished"));
            assert_eq!(actions.len(), 1);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    let timing = prediction.turns[0].timing.as_ref().unwrap();
    assert_eq!(timing.cost_tokens, Some(345));
    assert_eq!(timing.cost_ms, 12);

    let last = events[3].snapshot();
    assert_eq!(last.status, RunStatus::End);
    assert!(last.turns.is_empty());
}

#[tokio::test]
async fn stops_at_max_loop_count() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::default());
    let config = LoopConfig {
        max_loop_count: 3,
        ..fast_config()
    };
    let (agent, mut rx) = agent(&operator, &model, config);

    let status = agent.run("keep waiting").await.unwrap();

    assert_eq!(status, RunStatus::MaxLoop);
    assert_eq!(model.calls(), 3);
    assert_eq!(operator.executed(), vec!["wait", "wait", "wait"]);
    let events = drain(&mut rx);
    assert_eq!(events.last().unwrap().snapshot().loop_count, 3);
}

#[tokio::test]
async fn invalid_screenshots_end_in_max_loop_without_counting() {
    let invalid = ScreenshotResult {
        width: 0,
        ..frame()
    };
    let operator = Arc::new(MockOperator {
        frames: Mutex::new((0..20).map(|_| Ok(invalid.clone())).collect()),
        ..MockOperator::default()
    });
    let model = Arc::new(MockModel::default());
    let (agent, mut rx) = agent(&operator, &model, fast_config());

    let status = agent.run("anything").await.unwrap();

    assert_eq!(status, RunStatus::MaxLoop);
    assert_eq!(operator.screenshots(), 10);
    assert_eq!(model.calls(), 0);
    let events = drain(&mut rx);
    assert_eq!(events.last().unwrap().snapshot().loop_count, 0);
}

#[tokio::test]
async fn empty_prediction_is_skipped() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![reply_with("   ", &[]), finished()]));
    let (agent, mut rx) = agent(&operator, &model, fast_config());

    let status = agent.run("x").await.unwrap();

    assert_eq!(status, RunStatus::End);
    assert_eq!(model.calls(), 2);
    let predictions = drain(&mut rx)
        .iter()
        .flat_map(|e| e.snapshot().turns.clone())
        .filter(|t| matches!(t.payload, TurnPayload::Prediction { .. }))
        .count();
    assert_eq!(predictions, 1);
}

#[tokio::test]
async fn call_user_runs_the_action_then_stops() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![reply_with(
        "Thought: need help\nAction: click()\n\ncall_user()\n\nclick()",
        &["click", "call_user", "click"],
    )]));
    let (agent, _rx) = agent(&operator, &model, fast_config());

    assert_eq!(agent.run("x").await.unwrap(), RunStatus::CallUser);
    assert_eq!(operator.executed(), vec!["click", "call_user"]);
}

#[tokio::test]
async fn max_loop_sentinel_is_not_executed() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![reply_with("Action: max_loop()", &["max_loop"])]));
    let (agent, _rx) = agent(&operator, &model, fast_config());

    assert_eq!(agent.run("x").await.unwrap(), RunStatus::MaxLoop);
    assert!(operator.executed().is_empty());
}

#[tokio::test]
async fn environment_error_sentinel_reports_error_event() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![reply_with(
        "Thought: broken\nAction: error_env()\n\nclick()",
        &["error_env", "click"],
    )]));
    let (agent, mut rx) = agent(&operator, &model, fast_config());

    let status = agent.run("x").await.unwrap();

    assert_eq!(status, RunStatus::Error);
    assert!(operator.executed().is_empty());
    let events = drain(&mut rx);
    assert_eq!(last_data_status(&events), RunStatus::Error);
    match events.last().unwrap() {
        RunEvent::Error(snapshot, error) => {
            assert_eq!(snapshot.status, RunStatus::Error);
            assert_eq!(error.code, ErrorCode::EnvironmentError);
            assert_eq!(error.message, "Environment error: environment reported an error");
        }
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn executor_status_is_adopted() {
    let operator = Arc::new(MockOperator {
        status_for: Some(("click".into(), RunStatus::End)),
        ..MockOperator::default()
    });
    let model = Arc::new(MockModel::scripted(vec![reply_with(
        "Action: click()\n\nclick()",
        &["click", "click"],
    )]));
    let (agent, _rx) = agent(&operator, &model, fast_config());

    assert_eq!(agent.run("x").await.unwrap(), RunStatus::End);
    assert_eq!(operator.executed(), vec!["click"]);
}

#[tokio::test]
async fn exhausted_screenshot_retries_return_err() {
    let operator = Arc::new(MockOperator {
        always_fail: true,
        ..MockOperator::default()
    });
    let model = Arc::new(MockModel::default());
    let mut config = fast_config();
    config.retry.screenshot = RetryPolicy::new(2);
    let (agent, mut rx) = agent(&operator, &model, config);

    let err = agent.run("x").await.unwrap_err();

    assert!(matches!(err, PilotError::Screenshot(_)));
    assert_eq!(operator.screenshots(), 3);
    let events = drain(&mut rx);
    assert_eq!(last_data_status(&events), RunStatus::Error);
    match events.last().unwrap() {
        RunEvent::Error(_, error) => assert_eq!(error.code, ErrorCode::ScreenshotFailure),
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_before_model_call_releases_input_once() {
    let token = CancellationToken::new();
    let operator = Arc::new(MockOperator {
        cancel_on_screenshot: Some(token.clone()),
        ..MockOperator::default()
    });
    let model = Arc::new(MockModel::default());
    let (agent, mut rx) = agent(&operator, &model, fast_config());
    let agent = agent.with_cancel_token(token);

    let status = agent.run("x").await.unwrap();

    assert_eq!(status, RunStatus::UserStopped);
    assert_eq!(model.calls(), 0);
    assert_eq!(operator.executed(), vec!["user_stop"]);
    let events = drain(&mut rx);
    assert_eq!(last_data_status(&events), RunStatus::UserStopped);
    assert_eq!(events.last().unwrap().snapshot().loop_count, 0);
}

#[tokio::test]
async fn stop_interrupts_model_without_retry() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel {
        hang: true,
        ..MockModel::default()
    });
    let (agent, _rx) = agent(&operator, &model, fast_config());
    let handle = agent.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
    });

    let status = tokio::time::timeout(Duration::from_secs(5), agent.run("x"))
        .await
        .expect("run should stop promptly")
        .unwrap();

    assert_eq!(status, RunStatus::UserStopped);
    assert_eq!(model.calls(), 1);
    assert_eq!(operator.executed(), vec!["user_stop"]);
}

#[tokio::test]
async fn pause_blocks_until_resume() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![finished()]));
    let (agent, mut rx) = agent(&operator, &model, fast_config());
    let agent = Arc::new(agent);
    agent.pause();

    let task = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run("x").await })
    };

    loop {
        let event = rx.recv().await.unwrap();
        if event.snapshot().status == RunStatus::Paused {
            break;
        }
    }
    assert_eq!(operator.screenshots(), 0);
    agent.resume();

    let status = task.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::End);
    let statuses: Vec<RunStatus> = drain(&mut rx).iter().map(|e| e.snapshot().status).collect();
    assert_eq!(statuses.first(), Some(&RunStatus::Running));
    assert_eq!(statuses.last(), Some(&RunStatus::End));
}

#[tokio::test]
async fn pause_and_resume_mid_run_keeps_turns_in_order() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::scripted(vec![
        reply_with("Thought: look around\nAction: wait()", &["wait"]),
        finished(),
    ]));
    let (agent, mut rx) = agent(&operator, &model, fast_config());
    *model.pause_on_first_call.lock().unwrap() = Some(agent.handle());
    let agent = Arc::new(agent);

    let task = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run("x").await })
    };

    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.unwrap();
        let paused = event.snapshot().status == RunStatus::Paused;
        events.push(event);
        if paused {
            break;
        }
    }
    assert_eq!(model.calls(), 1);
    assert_eq!(operator.screenshots(), 1);
    assert_eq!(operator.executed(), vec!["wait"]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(operator.screenshots(), 1);
    agent.resume();

    assert_eq!(task.await.unwrap().unwrap(), RunStatus::End);
    events.extend(drain(&mut rx));

    let statuses: Vec<RunStatus> = events.iter().map(|e| e.snapshot().status).collect();
    let paused_at = statuses.iter().position(|s| *s == RunStatus::Paused).unwrap();
    assert_eq!(statuses[paused_at + 1], RunStatus::Running);
    assert_eq!(statuses.last(), Some(&RunStatus::End));

    let kinds: Vec<&str> = events
        .iter()
        .flat_map(|e| e.snapshot().turns.iter())
        .map(|t| match &t.payload {
            TurnPayload::Screenshot { .. } => "screenshot",
            TurnPayload::Prediction { .. } => "prediction",
            TurnPayload::Instruction { .. } => "instruction",
        })
        .collect();
    assert_eq!(kinds, vec!["screenshot", "prediction", "screenshot", "prediction"]);
    assert_eq!(events.last().unwrap().snapshot().loop_count, 2);
}

#[tokio::test]
async fn image_window_is_bounded() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::default());
    let config = LoopConfig {
        max_loop_count: 6,
        max_image_length: 2,
        ..fast_config()
    };
    let (agent, _rx) = agent(&operator, &model, config);

    assert_eq!(agent.run("x").await.unwrap(), RunStatus::MaxLoop);
    let counts = model.image_counts.lock().unwrap().clone();
    assert_eq!(counts, vec![1, 2, 2, 2, 2, 2]);
}

#[tokio::test]
async fn default_prompt_lists_operator_actions() {
    let operator = Arc::new(MockOperator::default());
    let model = Arc::new(MockModel::default());
    let (agent, _rx) = agent(&operator, &model, fast_config());
    let prompt = agent.system_prompt();
    assert!(prompt.contains("click(start_box='')"));
    assert!(prompt.contains("finished(content='')"));

    let custom = GuiAgent::new(operator, model, fast_config()).with_system_prompt("be brief");
    assert_eq!(custom.system_prompt(), "be brief");
}
