use std::collections::BTreeMap;

use crate::perception::types::ScreenContext;

/// Lifecycle states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Init,
    Running,
    Paused,
    MaxLoop,
    Error,
    End,
    UserStopped,
    CallUser,
}

impl RunStatus {
    /// `Running` and `Paused` are the only states that keep the loop alive.
    pub fn is_alive(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::MaxLoop
                | RunStatus::Error
                | RunStatus::End
                | RunStatus::UserStopped
                | RunStatus::CallUser
        )
    }
}

/// Action types with loop-level meaning. Everything else is opaque to the
/// controller and is interpreted by the operator.
pub mod sentinel {
    pub const FINISHED: &str = "finished";
    pub const CALL_USER: &str = "call_user";
    pub const ERROR_ENV: &str = "error_env";
    pub const MAX_LOOP: &str = "max_loop";
    pub const USER_STOP: &str = "user_stop";
}

/// One structured action extracted from a model prediction.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParsedAction {
    pub action_type: String,
    /// Raw inputs; box values are normalized strings such as `"[0.1,0.2,0.1,0.2]"`.
    #[serde(default)]
    pub action_inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
}

impl ParsedAction {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.action_inputs.insert(key.into(), value.into());
        self
    }

    pub fn input(&self, key: &str) -> Option<&str> {
        self.action_inputs.get(key).map(String::as_str)
    }

    pub fn is(&self, action_type: &str) -> bool {
        self.action_type == action_type
    }
}

/// Fixed-point quantization granularity the model was trained with.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Factors(pub f64, pub f64);

impl Factors {
    pub fn width(&self) -> f64 {
        self.0
    }

    pub fn height(&self) -> f64 {
        self.1
    }
}

impl Default for Factors {
    fn default() -> Self {
        Factors(1000.0, 1000.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    Human,
    Model,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnPayload {
    Instruction {
        text: String,
    },
    /// Image placeholder; the bytes travel in the run's parallel images array.
    Screenshot {
        screenshot_base64: String,
        context: ScreenContext,
    },
    Prediction {
        summary: String,
        actions: Vec<ParsedAction>,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnTiming {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub cost_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_tokens: Option<u64>,
}

impl TurnTiming {
    pub fn since(start: chrono::DateTime<chrono::Utc>) -> Self {
        let end = chrono::Utc::now();
        let cost_ms = (end - start).num_milliseconds().max(0) as u64;
        Self {
            start,
            end,
            cost_ms,
            cost_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Turn {
    pub origin: TurnOrigin,
    pub payload: TurnPayload,
    pub timing: Option<TurnTiming>,
}

impl Turn {
    pub fn instruction(text: impl Into<String>) -> Self {
        Self {
            origin: TurnOrigin::Human,
            payload: TurnPayload::Instruction { text: text.into() },
            timing: None,
        }
    }

    pub fn screenshot(screenshot_base64: String, context: ScreenContext, timing: TurnTiming) -> Self {
        Self {
            origin: TurnOrigin::Human,
            payload: TurnPayload::Screenshot {
                screenshot_base64,
                context,
            },
            timing: Some(timing),
        }
    }

    pub fn prediction(summary: String, actions: Vec<ParsedAction>, timing: TurnTiming) -> Self {
        Self {
            origin: TurnOrigin::Model,
            payload: TurnPayload::Prediction { summary, actions },
            timing: Some(timing),
        }
    }

    /// Human turns carrying a screenshot consume one entry of the images array.
    pub fn is_image(&self) -> bool {
        self.origin == TurnOrigin::Human && matches!(self.payload, TurnPayload::Screenshot { .. })
    }
}

/// Immutable view of a run handed to event subscribers.
///
/// `turns` holds only the turns appended since the previous event; the
/// initial and final events carry none.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunSnapshot {
    pub run_id: uuid::Uuid,
    pub instruction: String,
    pub status: RunStatus,
    pub loop_count: u32,
    pub turns: Vec<Turn>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}
