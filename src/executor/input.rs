// Physical input primitives behind a driver trait.
use async_trait::async_trait;

use crate::errors::PilotResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Low-level mouse/keyboard control used by [`ComputerOperator`].
///
/// Coordinates are in the driver's native pixel space; DPI correction
/// happens before the driver is called.
///
/// [`ComputerOperator`]: crate::executor::dispatcher::ComputerOperator
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn move_to(&self, x: i32, y: i32) -> PilotResult<()>;
    async fn click(&self, button: MouseButton) -> PilotResult<()>;
    async fn double_click(&self) -> PilotResult<()>;
    async fn press(&self, button: MouseButton) -> PilotResult<()>;
    async fn release(&self, button: MouseButton) -> PilotResult<()>;
    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> PilotResult<()>;
    async fn type_text(&self, text: &str) -> PilotResult<()>;
    /// Press all `keys` in order, then release them in reverse.
    async fn hotkey(&self, keys: &[String]) -> PilotResult<()>;
    /// Release anything still held (e.g. an interrupted drag).
    async fn release_all(&self) -> PilotResult<()>;
}

#[cfg(feature = "desktop")]
pub use desktop::EnigoDriver;

#[cfg(feature = "desktop")]
mod desktop {
    use async_trait::async_trait;
    use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

    use super::{InputDriver, MouseButton, ScrollDirection};
    use crate::errors::{PilotError, PilotResult};

    /// Drives the local desktop through enigo.
    ///
    /// A fresh `Enigo` is created per call on a blocking thread because the
    /// handle is not `Send` on every platform.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct EnigoDriver;

    async fn with_enigo<F>(op: F) -> PilotResult<()>
    where
        F: FnOnce(&mut Enigo) -> Result<(), String> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut enigo = Enigo::new(&Settings::default())
                .map_err(|e| PilotError::Execution(format!("enigo init: {e}")))?;
            op(&mut enigo).map_err(PilotError::Execution)
        })
        .await
        .map_err(|e| PilotError::Execution(format!("join: {e}")))?
    }

    fn button(b: MouseButton) -> Button {
        match b {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
            MouseButton::Middle => Button::Middle,
        }
    }

    fn key_from_name(name: &str) -> Option<Key> {
        let lower = name.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "ctrl" | "control" => Key::Control,
            "shift" => Key::Shift,
            "alt" | "option" => Key::Alt,
            "cmd" | "command" | "meta" | "win" | "super" => Key::Meta,
            "enter" | "return" => Key::Return,
            "tab" => Key::Tab,
            "esc" | "escape" => Key::Escape,
            "space" => Key::Space,
            "backspace" => Key::Backspace,
            "delete" | "del" => Key::Delete,
            "up" | "arrowup" => Key::UpArrow,
            "down" | "arrowdown" => Key::DownArrow,
            "left" | "arrowleft" => Key::LeftArrow,
            "right" | "arrowright" => Key::RightArrow,
            "home" => Key::Home,
            "end" => Key::End,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            "f1" => Key::F1,
            "f2" => Key::F2,
            "f3" => Key::F3,
            "f4" => Key::F4,
            "f5" => Key::F5,
            "f6" => Key::F6,
            "f7" => Key::F7,
            "f8" => Key::F8,
            "f9" => Key::F9,
            "f10" => Key::F10,
            "f11" => Key::F11,
            "f12" => Key::F12,
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Key::Unicode(c),
                    _ => return None,
                }
            }
        };
        Some(key)
    }

    #[async_trait]
    impl InputDriver for EnigoDriver {
        async fn move_to(&self, x: i32, y: i32) -> PilotResult<()> {
            with_enigo(move |e| e.move_mouse(x, y, Coordinate::Abs).map_err(|e| e.to_string())).await
        }

        async fn click(&self, b: MouseButton) -> PilotResult<()> {
            with_enigo(move |e| e.button(button(b), Direction::Click).map_err(|e| e.to_string())).await
        }

        async fn double_click(&self) -> PilotResult<()> {
            with_enigo(|e| {
                e.button(Button::Left, Direction::Click).map_err(|e| e.to_string())?;
                e.button(Button::Left, Direction::Click).map_err(|e| e.to_string())
            })
            .await
        }

        async fn press(&self, b: MouseButton) -> PilotResult<()> {
            with_enigo(move |e| e.button(button(b), Direction::Press).map_err(|e| e.to_string())).await
        }

        async fn release(&self, b: MouseButton) -> PilotResult<()> {
            with_enigo(move |e| e.button(button(b), Direction::Release).map_err(|e| e.to_string())).await
        }

        async fn scroll(&self, direction: ScrollDirection, amount: i32) -> PilotResult<()> {
            let (length, axis) = match direction {
                ScrollDirection::Up => (-amount, Axis::Vertical),
                ScrollDirection::Down => (amount, Axis::Vertical),
                ScrollDirection::Left => (-amount, Axis::Horizontal),
                ScrollDirection::Right => (amount, Axis::Horizontal),
            };
            with_enigo(move |e| e.scroll(length, axis).map_err(|e| e.to_string())).await
        }

        async fn type_text(&self, text: &str) -> PilotResult<()> {
            let text = text.to_string();
            with_enigo(move |e| e.text(&text).map_err(|e| e.to_string())).await
        }

        async fn hotkey(&self, keys: &[String]) -> PilotResult<()> {
            let keys = keys
                .iter()
                .map(|k| key_from_name(k).ok_or_else(|| PilotError::Execution(format!("unknown key: {k}"))))
                .collect::<PilotResult<Vec<Key>>>()?;
            with_enigo(move |e| {
                for k in &keys {
                    e.key(*k, Direction::Press).map_err(|e| e.to_string())?;
                }
                for k in keys.iter().rev() {
                    e.key(*k, Direction::Release).map_err(|e| e.to_string())?;
                }
                Ok(())
            })
            .await
        }

        async fn release_all(&self) -> PilotResult<()> {
            with_enigo(|e| {
                for b in [Button::Left, Button::Right, Button::Middle] {
                    let _ = e.button(b, Direction::Release);
                }
                Ok(())
            })
            .await
        }
    }
}
