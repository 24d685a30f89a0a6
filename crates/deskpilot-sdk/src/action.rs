//! A serializable vocabulary of connection actions.
//!
//! Agents that plan in JSON can deserialize an [`Action`] and hand it to
//! [`Connection::perform`] instead of matching on method names themselves.
//!
//! ```
//! use deskpilot_sdk::Action;
//!
//! let action: Action = serde_json::from_str(r#"{"action":"left_click","x":10,"y":20}"#).unwrap();
//! assert_eq!(action, Action::LeftClick { x: Some(10), y: Some(20) });
//! ```

use serde::{Deserialize, Serialize};

use crate::connection::{Connection, MouseButton, Screenshot};
use crate::error::{Error, Result};
use crate::shim::Operation;

/// One connection action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Send a key combination.
    Key {
        /// Combination such as `"ctrl+c"`.
        text: String,
    },
    /// Type text.
    Type {
        /// Text to type.
        text: String,
    },
    /// Move the pointer.
    MouseMove {
        /// Target column.
        x: i32,
        /// Target row.
        y: i32,
    },
    /// Press or release a button.
    MouseClick {
        /// Button to act on.
        button: MouseButton,
        /// Press when true, release when false.
        down: bool,
        /// Optional column.
        #[serde(default)]
        x: Option<i32>,
        /// Optional row.
        #[serde(default)]
        y: Option<i32>,
    },
    /// Left click.
    LeftClick {
        /// Optional column.
        #[serde(default)]
        x: Option<i32>,
        /// Optional row.
        #[serde(default)]
        y: Option<i32>,
    },
    /// Right click.
    RightClick {
        /// Optional column.
        #[serde(default)]
        x: Option<i32>,
        /// Optional row.
        #[serde(default)]
        y: Option<i32>,
    },
    /// Double click.
    DoubleClick {
        /// Optional column.
        #[serde(default)]
        x: Option<i32>,
        /// Optional row.
        #[serde(default)]
        y: Option<i32>,
    },
    /// Drag from the current position.
    LeftClickDrag {
        /// Target column.
        x: i32,
        /// Target row.
        y: i32,
    },
    /// Read the pointer position.
    CursorPosition,
    /// Capture the screen.
    Screenshot,
    /// Hand control to a human operator.
    YieldControl,
}

impl Action {
    /// The action's wire name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Key { .. } => "key",
            Self::Type { .. } => "type",
            Self::MouseMove { .. } => "mouse_move",
            Self::MouseClick { .. } => "mouse_click",
            Self::LeftClick { .. } => "left_click",
            Self::RightClick { .. } => "right_click",
            Self::DoubleClick { .. } => "double_click",
            Self::LeftClickDrag { .. } => "left_click_drag",
            Self::CursorPosition => "cursor_position",
            Self::Screenshot => "screenshot",
            Self::YieldControl => "yield_control",
        }
    }
}

/// Result of [`Connection::perform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutput {
    /// The action produced no value.
    Done,
    /// Pointer position.
    Position(i32, i32),
    /// Screen capture.
    Screenshot(Screenshot),
}

/// Both coordinates or neither; the composite clicks move the pointer first
/// and cannot do that with half a point.
fn point(action: &str, x: Option<i32>, y: Option<i32>) -> Result<Option<(i32, i32)>> {
    match (x, y) {
        (Some(x), Some(y)) => Ok(Some((x, y))),
        (None, None) => Ok(None),
        _ => Err(Error::Decode(format!("{action} needs both x and y, or neither"))),
    }
}

impl Connection {
    /// Run an [`Action`].
    pub fn perform(&self, action: Action) -> Operation<ActionOutput> {
        let this = self.clone();
        Operation::new(action.name(), async move { this.dispatch(action).await })
    }

    async fn dispatch(&self, action: Action) -> Result<ActionOutput> {
        match action {
            Action::Key { text } => self.key(text).await?,
            Action::Type { text } => self.type_text(text).await?,
            Action::MouseMove { x, y } => self.mouse_move(x, y).await?,
            Action::MouseClick { button, down, x, y } => {
                self.mouse_click(button, down, x, y).await?;
            }
            Action::LeftClick { x, y } => self.left_click(point("left_click", x, y)?).await?,
            Action::RightClick { x, y } => self.right_click(point("right_click", x, y)?).await?,
            Action::DoubleClick { x, y } => self.double_click(point("double_click", x, y)?).await?,
            Action::LeftClickDrag { x, y } => self.left_click_drag(x, y).await?,
            Action::CursorPosition => {
                let (x, y) = self.cursor_position().await?;
                return Ok(ActionOutput::Position(x, y));
            }
            Action::Screenshot => return Ok(ActionOutput::Screenshot(self.screenshot().await?)),
            Action::YieldControl => self.yield_control().await?,
        }
        Ok(ActionOutput::Done)
    }
}
