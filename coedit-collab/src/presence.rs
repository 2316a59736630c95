//! Ephemeral per-user presence: cursor, highlight, typing.
//!
//! Presence lives next to the document but is independent of it; a highlight
//! may reference text that has since been edited, and nothing corrects that.

use serde::{Deserialize, Serialize};

/// Cursor coordinate reported by the editor front-end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Line/column span of a selection, as reported by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SelectionRange {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self { start_line, start_column, end_line, end_column }
    }

    pub fn is_empty(&self) -> bool {
        self.start_line == self.end_line && self.start_column == self.end_column
    }
}

/// An active highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub selected_text: String,
    pub range: SelectionRange,
}

/// Presence of one user in one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceState {
    pub cursor: Option<Vec2>,
    pub highlight: Option<Highlight>,
    pub typing: bool,
}

impl PresenceState {
    pub fn move_cursor(&mut self, position: Vec2) {
        self.cursor = Some(position);
    }

    pub fn set_highlight(&mut self, selected_text: String, range: SelectionRange) {
        self.highlight = Some(Highlight { selected_text, range });
    }

    /// Returns whether a highlight was active.
    pub fn clear_highlight(&mut self) -> bool {
        self.highlight.take().is_some()
    }

    /// Returns whether the flag changed.
    pub fn set_typing(&mut self, typing: bool) -> bool {
        let changed = self.typing != typing;
        self.typing = typing;
        changed
    }

    /// True when nothing worth replaying to a newcomer is set.
    pub fn is_idle(&self) -> bool {
        self.cursor.is_none() && self.highlight.is_none() && !self.typing
    }
}
