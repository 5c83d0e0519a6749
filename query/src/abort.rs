use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::pin,
    rc::Rc,
};

use futures::future::{Either, FutureExt, Shared};
use futures_channel::oneshot;

/// Owner side of a cancellation token.
///
/// Cloning the controller shares the same token.
#[derive(Clone)]
pub struct AbortController {
    inner: Rc<AbortInner>,
}

/// Observer side of a cancellation token. Cheap to clone and pass to every step
/// of a long-running operation.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<AbortInner>,
}

struct AbortInner {
    aborted: Cell<bool>,
    sender: Cell<Option<oneshot::Sender<()>>>,
    receiver: Shared<oneshot::Receiver<()>>,
}

/// Returned by [`run_abortable`] when the signal fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl AbortController {
    /// Creates a controller whose signal has not fired.
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            inner: Rc::new(AbortInner {
                aborted: Cell::new(false),
                sender: Cell::new(Some(sender)),
                receiver: receiver.shared(),
            }),
        }
    }

    /// The signal observed by the operation.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: self.inner.clone(),
        }
    }

    /// Fires the signal. Returns false if it had already fired.
    pub fn abort(&self) -> bool {
        if self.inner.aborted.replace(true) {
            return false;
        }
        if let Some(sender) = self.inner.sender.take() {
            let _ = sender.send(());
        }
        true
    }

    /// Returns true once [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        AbortController::new().signal()
    }

    /// Returns true once the owning controller has aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Resolves when the signal fires.
    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        if self.inner.receiver.clone().await.is_err() {
            // The sender lives as long as the signal, so this only happens once
            // the controller state is gone. Never resolve in that case.
            futures::future::pending::<()>().await;
        }
    }

    /// Returns true if both signals belong to the same controller.
    pub fn same(&self, other: &AbortSignal) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl std::fmt::Debug for AbortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Runs `fut` until it completes or `signal` fires, whichever happens first.
pub async fn run_abortable<F>(signal: &AbortSignal, fut: F) -> Result<F::Output, Aborted>
where
    F: Future,
{
    if signal.is_aborted() {
        return Err(Aborted);
    }
    let fut = pin!(fut);
    let cancellation = pin!(signal.aborted());
    match futures::future::select(fut, cancellation).await {
        Either::Left((result, _)) => Ok(result),
        Either::Right(_) => Err(Aborted),
    }
}

/// Holds the token of the single current operation of one kind.
///
/// Starting a new operation aborts the previous one ("abort and create"). Used for
/// startup validation, drawing completion, workspace prefetch and job submission.
#[derive(Clone, Default)]
pub struct CancelableSlot {
    current: Rc<RefCell<Option<AbortController>>>,
}

impl CancelableSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the current operation, if any, and returns the signal for a new one.
    pub fn acquire(&self) -> AbortSignal {
        let controller = AbortController::new();
        let signal = controller.signal();
        let previous = self
            .current
            .try_borrow_mut()
            .expect("acquire borrow_mut")
            .replace(controller);
        if let Some(previous) = previous {
            previous.abort();
        }
        signal
    }

    /// Clears the slot if `signal` still belongs to the current operation.
    ///
    /// Returns false when a newer operation has taken the slot in the meantime.
    pub fn release(&self, signal: &AbortSignal) -> bool {
        let mut current = self.current.try_borrow_mut().expect("release borrow_mut");
        let is_current = current
            .as_ref()
            .map(|controller| controller.signal().same(signal))
            .unwrap_or(false);
        if is_current {
            current.take();
        }
        is_current
    }

    /// Aborts and clears the current operation. Returns true if one was running.
    pub fn cancel(&self) -> bool {
        let current = self
            .current
            .try_borrow_mut()
            .expect("cancel borrow_mut")
            .take();
        match current {
            Some(controller) => controller.abort(),
            None => false,
        }
    }

    /// Returns true while an operation holds the slot.
    pub fn is_active(&self) -> bool {
        self.current
            .try_borrow()
            .expect("is_active borrow")
            .is_some()
    }
}
