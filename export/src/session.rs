use std::{cell::RefCell, rc::Rc};

/// Snapshot of the drawing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawingSessionState {
    /// A sketch is in progress.
    pub is_active: bool,
    /// Vertices placed so far.
    pub click_count: u32,
}

/// Tracks the sketch tool between start and completion or cancellation.
#[derive(Debug, Clone, Default)]
pub struct DrawingSession {
    state: DrawingSessionState,
}

impl DrawingSession {
    /// Inactive session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> DrawingSessionState {
        self.state
    }

    /// Starts a new sketch, discarding any previous clicks.
    pub fn start(&mut self) {
        self.state = DrawingSessionState {
            is_active: true,
            click_count: 0,
        };
    }

    /// Records a placed vertex. Ignored while no sketch is active.
    pub fn register_click(&mut self) -> u32 {
        if self.state.is_active {
            self.state.click_count = self.state.click_count.saturating_add(1);
        }
        self.state.click_count
    }

    /// Ends the sketch. Returns the number of placed vertices, or None if no sketch was active.
    pub fn complete(&mut self) -> Option<u32> {
        if !self.state.is_active {
            return None;
        }
        let clicks = self.state.click_count;
        self.state = DrawingSessionState::default();
        Some(clicks)
    }

    /// Abandons the sketch. Returns false if no sketch was active.
    pub fn cancel(&mut self) -> bool {
        let was_active = self.state.is_active;
        self.state = DrawingSessionState::default();
        was_active
    }

    /// Back to the initial state, e.g. when the widget closes.
    pub fn reset(&mut self) {
        self.state = DrawingSessionState::default();
    }
}

/// Progress of a submission, as shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SubmissionPhase {
    /// Nothing running.
    #[default]
    Idle,
    /// Validating and assembling parameters.
    Preparing,
    /// Uploading an attached dataset.
    Uploading,
    /// Applying job directives.
    Finalizing,
    /// Waiting for the server.
    Submitting,
}

impl SubmissionPhase {
    /// Lowercase name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionPhase::Idle => "idle",
            SubmissionPhase::Preparing => "preparing",
            SubmissionPhase::Uploading => "uploading",
            SubmissionPhase::Finalizing => "finalizing",
            SubmissionPhase::Submitting => "submitting",
        }
    }

    /// Returns true for every phase but [`Idle`](SubmissionPhase::Idle).
    pub fn is_busy(&self) -> bool {
        *self != SubmissionPhase::Idle
    }
}

impl std::fmt::Display for SubmissionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-owner lease over the shared drawing resources (sketch tool and graphics layer).
///
/// Only one widget instance draws at a time. The instance taking over receives the previous
/// owner, which must cancel its sketch and clear its graphics.
#[derive(Debug, Clone, Default)]
pub struct DrawingSurface {
    owner: Rc<RefCell<Option<String>>>,
}

impl DrawingSurface {
    /// Unowned surface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the surface for `owner`. Returns the previous owner, if it was someone else.
    pub fn acquire(&self, owner: &str) -> Option<String> {
        let mut current = self.owner.try_borrow_mut().expect("acquire borrow_mut");
        match current.replace(owner.to_string()) {
            Some(previous) if previous != owner => Some(previous),
            _ => None,
        }
    }

    /// Gives the surface up. Does nothing unless `owner` holds it.
    pub fn release(&self, owner: &str) -> bool {
        let mut current = self.owner.try_borrow_mut().expect("release borrow_mut");
        if current.as_deref() == Some(owner) {
            current.take();
            true
        } else {
            false
        }
    }

    /// Current owner.
    pub fn owner(&self) -> Option<String> {
        self.owner.try_borrow().expect("owner borrow").clone()
    }

    /// Returns true if `owner` holds the surface.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.try_borrow().expect("is_owned_by borrow").as_deref() == Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawing_lifecycle() {
        let mut session = DrawingSession::new();
        assert_eq!(session.register_click(), 0);

        session.start();
        session.register_click();
        session.register_click();
        assert_eq!(
            session.state(),
            DrawingSessionState {
                is_active: true,
                click_count: 2
            }
        );
        assert_eq!(session.complete(), Some(2));
        assert_eq!(session.state(), DrawingSessionState::default());
        assert_eq!(session.complete(), None);
    }

    #[test]
    fn restart_and_cancel() {
        let mut session = DrawingSession::new();
        session.start();
        session.register_click();
        session.start();
        assert_eq!(session.state().click_count, 0);

        assert!(session.cancel());
        assert!(!session.cancel());

        session.start();
        session.register_click();
        session.reset();
        assert!(!session.state().is_active);
    }

    #[test]
    fn phases() {
        assert_eq!(SubmissionPhase::default(), SubmissionPhase::Idle);
        assert!(!SubmissionPhase::Idle.is_busy());
        assert!(SubmissionPhase::Uploading.is_busy());
        assert_eq!(SubmissionPhase::Finalizing.to_string(), "finalizing");
    }

    #[test]
    fn surface_has_one_owner() {
        let surface = DrawingSurface::new();
        assert_eq!(surface.acquire("widget-1"), None);
        assert_eq!(surface.acquire("widget-1"), None);
        assert_eq!(surface.acquire("widget-2"), Some("widget-1".to_string()));

        // A stale release leaves the new owner in place.
        assert!(!surface.release("widget-1"));
        assert!(surface.is_owned_by("widget-2"));
        assert!(surface.release("widget-2"));
        assert_eq!(surface.owner(), None);
    }
}
