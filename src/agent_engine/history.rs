use crate::agent_engine::state::Turn;

/// Conversation turns plus the parallel images array sent to the model.
///
/// Each screenshot turn owns exactly one entry of `images`, in order. When
/// the image count exceeds `max_image_length`, the oldest images and the same
/// number of the earliest screenshot turns are dropped together. Instruction
/// and model turns are never removed, even if the screenshot they answered is
/// gone: only image volume is bounded.
pub struct HistoryWindow {
    conversation: Vec<Turn>,
    images: Vec<String>,
    max_image_length: usize,
}

impl HistoryWindow {
    pub fn new(max_image_length: usize) -> Self {
        Self {
            conversation: Vec::new(),
            images: Vec::new(),
            max_image_length,
        }
    }

    /// Append a turn; screenshot turns also append their image and trim.
    pub fn push(&mut self, turn: Turn) {
        if let crate::agent_engine::state::TurnPayload::Screenshot { screenshot_base64, .. } = &turn.payload {
            if turn.is_image() {
                self.images.push(screenshot_base64.clone());
            }
        }
        self.conversation.push(turn);
        self.trim();
    }

    /// Drop the oldest image/screenshot-turn pairs beyond the window.
    pub fn trim(&mut self) {
        if self.images.len() <= self.max_image_length {
            return;
        }
        let excess = self.images.len() - self.max_image_length;
        self.images.drain(..excess);

        let mut to_drop = excess;
        self.conversation.retain(|turn| {
            if to_drop > 0 && turn.is_image() {
                to_drop -= 1;
                false
            } else {
                true
            }
        });

        tracing::debug!(
            dropped = excess,
            images = self.images.len(),
            turns = self.conversation.len(),
            "history window trimmed"
        );
    }

    pub fn conversation(&self) -> &[Turn] {
        &self.conversation
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }
}
