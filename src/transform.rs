//! Pan and zoom state for presenting a composite result
//!
//! The transform only describes how the result is displayed; it never
//! touches result pixels. Updates are last-writer-wins.

use serde::{Deserialize, Serialize};

pub const MIN_SCALE: f32 = 0.5;
pub const MAX_SCALE: f32 = 3.0;
/// Multiplicative step used by `zoom_in` / `zoom_out`
pub const ZOOM_STEP: f32 = 1.1;

/// Which interactions the settings allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub allow_resize: bool,
    pub allow_move: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            allow_resize: true,
            allow_move: true,
        }
    }
}

impl From<&crate::settings::Settings> for Permissions {
    fn from(settings: &crate::settings::Settings) -> Self {
        Self {
            allow_resize: settings.allow_resize,
            allow_move: settings.allow_move,
        }
    }
}

/// Scale, offset and drag state of the view
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewTransform {
    scale: f32,
    offset: (f32, f32),
    dragging: bool,
    #[serde(skip)]
    drag_anchor: (f32, f32),
    permissions: Permissions,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self::new(Permissions::default())
    }
}

impl ViewTransform {
    #[must_use]
    pub fn new(permissions: Permissions) -> Self {
        Self {
            scale: 1.0,
            offset: (0.0, 0.0),
            dragging: false,
            drag_anchor: (0.0, 0.0),
            permissions,
        }
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    #[must_use]
    pub fn offset(&self) -> (f32, f32) {
        self.offset
    }

    #[must_use]
    pub fn is_dragging(&self) -> bool {
        self.dragging
    }

    #[must_use]
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Replace the permissions; revoking `allow_move` ends any drag
    pub fn set_permissions(&mut self, permissions: Permissions) {
        self.permissions = permissions;
        if !permissions.allow_move {
            self.dragging = false;
        }
    }

    /// Multiply the scale by `factor`, clamped to the allowed range
    ///
    /// Returns whether the scale changed.
    pub fn zoom_by(&mut self, factor: f32) -> bool {
        if !self.permissions.allow_resize || !factor.is_finite() || factor <= 0.0 {
            return false;
        }
        let next = (self.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
        let changed = (next - self.scale).abs() > f32::EPSILON;
        self.scale = next;
        changed
    }

    pub fn zoom_in(&mut self) -> bool {
        self.zoom_by(ZOOM_STEP)
    }

    pub fn zoom_out(&mut self) -> bool {
        self.zoom_by(1.0 / ZOOM_STEP)
    }

    /// Start dragging at pointer position `(x, y)`
    pub fn begin_drag(&mut self, x: f32, y: f32) -> bool {
        if !self.permissions.allow_move {
            return false;
        }
        self.dragging = true;
        self.drag_anchor = (x - self.offset.0, y - self.offset.1);
        true
    }

    /// Move the pointer while dragging; ignored when not dragging
    pub fn drag_to(&mut self, x: f32, y: f32) -> bool {
        if !self.dragging {
            return false;
        }
        self.offset = (x - self.drag_anchor.0, y - self.drag_anchor.1);
        true
    }

    pub fn end_drag(&mut self) {
        self.dragging = false;
    }

    /// Back to scale 1.0 and offset (0, 0)
    pub fn reset(&mut self) {
        self.scale = 1.0;
        self.offset = (0.0, 0.0);
        self.dragging = false;
    }
}

/// Scoped attachment of interaction handlers to a transform
///
/// Input events are routed through the view while it lives; dropping it
/// detaches the handlers and ends any drag in progress.
#[derive(Debug)]
pub struct InteractiveView<'a> {
    transform: &'a mut ViewTransform,
}

impl<'a> InteractiveView<'a> {
    #[must_use]
    pub fn attach(transform: &'a mut ViewTransform) -> Self {
        Self { transform }
    }

    /// Wheel input: positive delta zooms in
    pub fn on_wheel(&mut self, delta: f32) -> bool {
        if delta > 0.0 {
            self.transform.zoom_in()
        } else if delta < 0.0 {
            self.transform.zoom_out()
        } else {
            false
        }
    }

    pub fn on_pointer_down(&mut self, x: f32, y: f32) -> bool {
        self.transform.begin_drag(x, y)
    }

    pub fn on_pointer_move(&mut self, x: f32, y: f32) -> bool {
        self.transform.drag_to(x, y)
    }

    pub fn on_pointer_up(&mut self) {
        self.transform.end_drag();
    }

    pub fn on_reset(&mut self) {
        self.transform.reset();
    }

    #[must_use]
    pub fn transform(&self) -> &ViewTransform {
        self.transform
    }
}

impl Drop for InteractiveView<'_> {
    fn drop(&mut self) {
        self.transform.end_drag();
    }
}
