// Action executor contract and the desktop dispatch table.
use std::time::Duration;

use async_trait::async_trait;

use crate::agent_engine::state::{sentinel, Factors, ParsedAction, RunStatus};
use crate::errors::PilotResult;
use crate::executor::coordinator::{box_to_screen_coords, ScreenPoint};
use crate::executor::input::{InputDriver, MouseButton, ScrollDirection};
use crate::executor::text_input::plan_typing;
use crate::perception::traits::ScreenCapture;
use crate::perception::types::ScreenshotResult;

/// Everything an operator needs to perform one parsed action.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteParams<'a> {
    pub action: &'a ParsedAction,
    pub screen_width: u32,
    pub screen_height: u32,
    pub scale_factor: f64,
    pub factors: Factors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Performed,
    /// Nothing to do for this action (sentinels, screenshot).
    NoOp,
    /// Recognized but not actionable, e.g. a box that failed to resolve.
    Skipped,
    /// Not in the operator's declared action set.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOutput {
    /// Status the environment wants the loop to adopt. The controller
    /// applies it verbatim and otherwise keeps termination authority.
    pub status: Option<RunStatus>,
    pub outcome: ActionOutcome,
}

impl ExecuteOutput {
    pub fn outcome(outcome: ActionOutcome) -> Self {
        Self { status: None, outcome }
    }
}

/// Environment boundary: screenshot provider and action executor.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Action signatures advertised to the model in the default system prompt.
    fn action_spaces(&self) -> Vec<String>;

    async fn screenshot(&self) -> PilotResult<ScreenshotResult>;

    async fn execute(&self, params: ExecuteParams<'_>) -> PilotResult<ExecuteOutput>;
}

/// Action vocabulary understood by [`ComputerOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Click,
    DoubleClick,
    RightClick,
    Hover,
    Drag,
    Scroll,
    Type,
    Hotkey,
    Wait,
    Screenshot,
    Finished,
    CallUser,
    UserStop,
    ErrorEnv,
    MaxLoop,
}

impl ActionKind {
    pub const ALL: [ActionKind; 15] = [
        ActionKind::Click,
        ActionKind::DoubleClick,
        ActionKind::RightClick,
        ActionKind::Hover,
        ActionKind::Drag,
        ActionKind::Scroll,
        ActionKind::Type,
        ActionKind::Hotkey,
        ActionKind::Wait,
        ActionKind::Screenshot,
        ActionKind::Finished,
        ActionKind::CallUser,
        ActionKind::UserStop,
        ActionKind::ErrorEnv,
        ActionKind::MaxLoop,
    ];

    pub fn parse(action_type: &str) -> Option<Self> {
        let kind = match action_type.trim().to_ascii_lowercase().as_str() {
            "click" | "left_single" | "left_click" => ActionKind::Click,
            "left_double" | "double_click" => ActionKind::DoubleClick,
            "right_single" | "right_click" => ActionKind::RightClick,
            "hover" | "mouse_move" => ActionKind::Hover,
            "drag" | "select" | "left_click_drag" => ActionKind::Drag,
            "scroll" => ActionKind::Scroll,
            "type" => ActionKind::Type,
            "hotkey" => ActionKind::Hotkey,
            "wait" => ActionKind::Wait,
            "screenshot" => ActionKind::Screenshot,
            sentinel::FINISHED => ActionKind::Finished,
            sentinel::CALL_USER => ActionKind::CallUser,
            sentinel::USER_STOP => ActionKind::UserStop,
            sentinel::ERROR_ENV => ActionKind::ErrorEnv,
            sentinel::MAX_LOOP => ActionKind::MaxLoop,
            _ => return None,
        };
        Some(kind)
    }

    /// Prompt signature, for kinds the model is allowed to emit.
    pub fn signature(self) -> Option<&'static str> {
        let sig = match self {
            ActionKind::Click => "click(start_box='<|box_start|>(x1,y1)<|box_end|>')",
            ActionKind::DoubleClick => "left_double(start_box='<|box_start|>(x1,y1)<|box_end|>')",
            ActionKind::RightClick => "right_single(start_box='<|box_start|>(x1,y1)<|box_end|>')",
            ActionKind::Hover => "hover(start_box='<|box_start|>(x1,y1)<|box_end|>')",
            ActionKind::Drag => {
                "drag(start_box='<|box_start|>(x1,y1)<|box_end|>', end_box='<|box_start|>(x3,y3)<|box_end|>')"
            }
            ActionKind::Hotkey => "hotkey(key='')",
            ActionKind::Type => {
                "type(content='') #If you want to submit your input, use \"\\n\" at the end of `content`."
            }
            ActionKind::Scroll => {
                "scroll(start_box='<|box_start|>(x1,y1)<|box_end|>', direction='down or up or right or left')"
            }
            ActionKind::Wait => "wait() #Sleep for 5s and take a screenshot to check for any changes.",
            ActionKind::Finished => "finished(content='') #Submit the task with a short summary.",
            ActionKind::CallUser => {
                "call_user() # Submit the task and call the user when the task is unsolvable, or when you need the user's help."
            }
            ActionKind::Screenshot
            | ActionKind::UserStop
            | ActionKind::ErrorEnv
            | ActionKind::MaxLoop => return None,
        };
        Some(sig)
    }
}

/// Operator that captures frames from a [`ScreenCapture`] and performs
/// actions through an [`InputDriver`].
pub struct ComputerOperator<D, C> {
    driver: D,
    capture: C,
    supported: Vec<ActionKind>,
    wait: Duration,
    scroll_amount: i32,
    /// macOS input APIs take logical points; elsewhere pixels are physical.
    apply_scale_factor: bool,
}

impl<D: InputDriver, C: ScreenCapture> ComputerOperator<D, C> {
    pub fn new(driver: D, capture: C) -> Self {
        Self {
            driver,
            capture,
            supported: ActionKind::ALL.to_vec(),
            wait: Duration::from_secs(5),
            scroll_amount: 5,
            apply_scale_factor: !cfg!(target_os = "macos"),
        }
    }

    pub fn with_supported(mut self, supported: Vec<ActionKind>) -> Self {
        self.supported = supported;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_scale_correction(mut self, apply: bool) -> Self {
        self.apply_scale_factor = apply;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn point(&self, params: &ExecuteParams<'_>, key: &str) -> ScreenPoint {
        let dpr = if self.apply_scale_factor {
            params.scale_factor
        } else {
            1.0
        };
        params
            .action
            .input(key)
            .map(|b| {
                box_to_screen_coords(b, params.screen_width, params.screen_height, params.factors)
                    .scaled(dpr)
            })
            .unwrap_or(ScreenPoint::NONE)
    }

    async fn pointer(&self, point: ScreenPoint, button: Option<MouseButton>, double: bool) -> PilotResult<ActionOutcome> {
        let Some((x, y)) = point.resolved() else {
            return Ok(ActionOutcome::Skipped);
        };
        self.driver.move_to(x.round() as i32, y.round() as i32).await?;
        match (button, double) {
            (_, true) => self.driver.double_click().await?,
            (Some(b), false) => self.driver.click(b).await?,
            (None, false) => {}
        }
        Ok(ActionOutcome::Performed)
    }

    async fn dispatch(&self, kind: ActionKind, params: &ExecuteParams<'_>) -> PilotResult<ActionOutcome> {
        let action = params.action;
        match kind {
            ActionKind::Click => self.pointer(self.point(params, "start_box"), Some(MouseButton::Left), false).await,
            ActionKind::DoubleClick => self.pointer(self.point(params, "start_box"), None, true).await,
            ActionKind::RightClick => {
                self.pointer(self.point(params, "start_box"), Some(MouseButton::Right), false).await
            }
            ActionKind::Hover => self.pointer(self.point(params, "start_box"), None, false).await,

            ActionKind::Drag => {
                let start = self.point(params, "start_box").resolved();
                let end = self.point(params, "end_box").resolved();
                let (Some((sx, sy)), Some((ex, ey))) = (start, end) else {
                    return Ok(ActionOutcome::Skipped);
                };
                self.driver.move_to(sx.round() as i32, sy.round() as i32).await?;
                self.driver.press(MouseButton::Left).await?;
                self.driver.move_to(ex.round() as i32, ey.round() as i32).await?;
                self.driver.release(MouseButton::Left).await?;
                Ok(ActionOutcome::Performed)
            }

            ActionKind::Scroll => {
                let Some(direction) = action.input("direction").and_then(ScrollDirection::parse) else {
                    tracing::warn!(direction = ?action.input("direction"), "scroll without a usable direction");
                    return Ok(ActionOutcome::Skipped);
                };
                if let Some((x, y)) = self.point(params, "start_box").resolved() {
                    self.driver.move_to(x.round() as i32, y.round() as i32).await?;
                }
                self.driver.scroll(direction, self.scroll_amount).await?;
                Ok(ActionOutcome::Performed)
            }

            ActionKind::Type => {
                let plan = plan_typing(action.input("content").unwrap_or_default());
                if !plan.text.is_empty() {
                    self.driver.type_text(&plan.text).await?;
                }
                if plan.commit {
                    self.driver.hotkey(&["enter".to_string()]).await?;
                }
                Ok(ActionOutcome::Performed)
            }

            ActionKind::Hotkey => {
                let raw = action.input("key").or_else(|| action.input("hotkey")).unwrap_or_default();
                let keys: Vec<String> = raw
                    .split(|c: char| c.is_whitespace() || c == '+')
                    .filter(|k| !k.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect();
                if keys.is_empty() {
                    return Ok(ActionOutcome::Skipped);
                }
                self.driver.hotkey(&keys).await?;
                Ok(ActionOutcome::Performed)
            }

            ActionKind::Wait => {
                tokio::time::sleep(self.wait).await;
                Ok(ActionOutcome::Performed)
            }

            ActionKind::UserStop => {
                self.driver.release_all().await?;
                Ok(ActionOutcome::Performed)
            }

            ActionKind::Screenshot
            | ActionKind::Finished
            | ActionKind::CallUser
            | ActionKind::ErrorEnv
            | ActionKind::MaxLoop => Ok(ActionOutcome::NoOp),
        }
    }
}

#[async_trait]
impl<D: InputDriver, C: ScreenCapture> Operator for ComputerOperator<D, C> {
    fn action_spaces(&self) -> Vec<String> {
        self.supported
            .iter()
            .filter_map(|k| k.signature())
            .map(str::to_string)
            .collect()
    }

    async fn screenshot(&self) -> PilotResult<ScreenshotResult> {
        self.capture.capture().await
    }

    async fn execute(&self, params: ExecuteParams<'_>) -> PilotResult<ExecuteOutput> {
        let action_type = params.action.action_type.as_str();
        let kind = match ActionKind::parse(action_type) {
            Some(kind) if self.supported.contains(&kind) => kind,
            _ => {
                tracing::warn!(action_type, "unsupported action");
                return Ok(ExecuteOutput::outcome(ActionOutcome::Unsupported));
            }
        };

        let outcome = self.dispatch(kind, &params).await?;
        tracing::info!(action_type, ?kind, ?outcome, "action dispatched");
        Ok(ExecuteOutput::outcome(outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingDriver {
        fn log(&self, s: String) -> PilotResult<()> {
            self.calls.lock().unwrap().push(s);
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InputDriver for RecordingDriver {
        async fn move_to(&self, x: i32, y: i32) -> PilotResult<()> {
            self.log(format!("move {x},{y}"))
        }
        async fn click(&self, button: MouseButton) -> PilotResult<()> {
            self.log(format!("click {button:?}"))
        }
        async fn double_click(&self) -> PilotResult<()> {
            self.log("double".into())
        }
        async fn press(&self, button: MouseButton) -> PilotResult<()> {
            self.log(format!("press {button:?}"))
        }
        async fn release(&self, button: MouseButton) -> PilotResult<()> {
            self.log(format!("release {button:?}"))
        }
        async fn scroll(&self, direction: ScrollDirection, amount: i32) -> PilotResult<()> {
            self.log(format!("scroll {direction:?} {amount}"))
        }
        async fn type_text(&self, text: &str) -> PilotResult<()> {
            self.log(format!("type {text}"))
        }
        async fn hotkey(&self, keys: &[String]) -> PilotResult<()> {
            self.log(format!("hotkey {}", keys.join("+")))
        }
        async fn release_all(&self) -> PilotResult<()> {
            self.log("release_all".into())
        }
    }

    struct BlankScreen;

    #[async_trait]
    impl ScreenCapture for BlankScreen {
        async fn capture(&self) -> PilotResult<ScreenshotResult> {
            Ok(ScreenshotResult {
                base64: "aGk=".into(),
                width: 1000,
                height: 500,
                scale_factor: 2.0,
            })
        }
    }

    fn operator() -> ComputerOperator<RecordingDriver, BlankScreen> {
        ComputerOperator::new(RecordingDriver::default(), BlankScreen)
            .with_wait(Duration::from_millis(1))
            .with_scale_correction(true)
    }

    async fn run(op: &ComputerOperator<RecordingDriver, BlankScreen>, action: ParsedAction) -> ExecuteOutput {
        op.execute(ExecuteParams {
            action: &action,
            screen_width: 1000,
            screen_height: 500,
            scale_factor: 2.0,
            factors: Factors::default(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn click_moves_with_dpi_correction() {
        let op = operator();
        let out = run(&op, ParsedAction::new("click").with_input("start_box", "[0.5,0.5,0.5,0.5]")).await;
        assert_eq!(out.outcome, ActionOutcome::Performed);
        assert_eq!(op.driver().calls(), vec!["move 1000,500", "click Left"]);
    }

    #[tokio::test]
    async fn scale_correction_can_be_disabled() {
        let op = operator().with_scale_correction(false);
        run(&op, ParsedAction::new("left_double").with_input("start_box", "[0.1,0.2]")).await;
        assert_eq!(op.driver().calls(), vec!["move 100,100", "double"]);
    }

    #[tokio::test]
    async fn unresolvable_box_is_skipped() {
        let op = operator();
        let out = run(&op, ParsedAction::new("click").with_input("start_box", "")).await;
        assert_eq!(out.outcome, ActionOutcome::Skipped);
        assert!(op.driver().calls().is_empty());
    }

    #[tokio::test]
    async fn drag_presses_moves_and_releases() {
        let op = operator().with_scale_correction(false);
        let action = ParsedAction::new("drag")
            .with_input("start_box", "[0.1,0.1]")
            .with_input("end_box", "[0.2,0.2]");
        run(&op, action).await;
        assert_eq!(
            op.driver().calls(),
            vec!["move 100,50", "press Left", "move 200,100", "release Left"]
        );
    }

    #[tokio::test]
    async fn type_with_newline_commits() {
        let op = operator();
        run(&op, ParsedAction::new("type").with_input("content", "hello\\n")).await;
        assert_eq!(op.driver().calls(), vec!["type hello", "hotkey enter"]);
    }

    #[tokio::test]
    async fn hotkey_splits_keys() {
        let op = operator();
        run(&op, ParsedAction::new("hotkey").with_input("key", "Ctrl Shift+T")).await;
        assert_eq!(op.driver().calls(), vec!["hotkey ctrl+shift+t"]);
    }

    #[tokio::test]
    async fn scroll_without_direction_is_skipped() {
        let op = operator();
        let out = run(&op, ParsedAction::new("scroll")).await;
        assert_eq!(out.outcome, ActionOutcome::Skipped);
        let out = run(&op, ParsedAction::new("scroll").with_input("direction", "up")).await;
        assert_eq!(out.outcome, ActionOutcome::Performed);
        assert_eq!(op.driver().calls(), vec!["scroll Up 5"]);
    }

    #[tokio::test]
    async fn sentinels_are_no_ops_and_user_stop_releases() {
        let op = operator();
        assert_eq!(run(&op, ParsedAction::new("finished")).await.outcome, ActionOutcome::NoOp);
        assert_eq!(run(&op, ParsedAction::new("call_user")).await.outcome, ActionOutcome::NoOp);
        assert_eq!(run(&op, ParsedAction::new("user_stop")).await.outcome, ActionOutcome::Performed);
        assert_eq!(op.driver().calls(), vec!["release_all"]);
    }

    #[tokio::test]
    async fn unknown_and_undeclared_actions_are_unsupported() {
        let op = operator().with_supported(vec![ActionKind::Click]);
        assert_eq!(run(&op, ParsedAction::new("teleport")).await.outcome, ActionOutcome::Unsupported);
        assert_eq!(
            run(&op, ParsedAction::new("type").with_input("content", "x")).await.outcome,
            ActionOutcome::Unsupported
        );
        assert!(op.driver().calls().is_empty());
        assert_eq!(op.action_spaces().len(), 1);
    }
}
