use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use futures::future::{FutureExt, LocalBoxFuture};
use leptos::*;
use slotmap::SlotMap;

use crate::{run_abortable, AbortController, AbortSignal, QueryError};

/// Status of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum MutationStatus {
    /// Not started, or reset.
    #[default]
    Idle,
    /// The latest call is in flight.
    Loading,
    /// The latest call succeeded.
    Success,
    /// The latest call failed.
    Error,
}

/// Visible state of a mutation, owned by its latest call.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<V> {
    /// Current status.
    pub status: MutationStatus,
    /// Result of the latest successful call.
    pub data: Option<V>,
    /// Error of the latest failed call.
    pub error: Option<QueryError>,
}

impl<V> Default for MutationState<V> {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

/// Lifecycle callbacks of a mutation. None of them run for a cancelled call.
pub struct MutationOptions<Vars, V> {
    /// Invoked with the result and variables of every successful call.
    pub on_success: Option<Rc<dyn Fn(&V, &Vars)>>,
    /// Invoked with the error and variables of every failed call.
    pub on_error: Option<Rc<dyn Fn(&QueryError, &Vars)>>,
    /// Invoked after `on_success` or `on_error`.
    pub on_settled: Option<Rc<dyn Fn(Result<&V, &QueryError>, &Vars)>>,
}

impl<Vars, V> Default for MutationOptions<Vars, V> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<Vars, V> Clone for MutationOptions<Vars, V> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<Vars, V> MutationOptions<Vars, V> {
    /// Set the success callback.
    pub fn on_success(self, callback: impl Fn(&V, &Vars) + 'static) -> Self {
        Self {
            on_success: Some(Rc::new(callback)),
            ..self
        }
    }

    /// Set the error callback.
    pub fn on_error(self, callback: impl Fn(&QueryError, &Vars) + 'static) -> Self {
        Self {
            on_error: Some(Rc::new(callback)),
            ..self
        }
    }

    /// Set the settled callback.
    pub fn on_settled(self, callback: impl Fn(Result<&V, &QueryError>, &Vars) + 'static) -> Self {
        Self {
            on_settled: Some(Rc::new(callback)),
            ..self
        }
    }
}

type MutationFn<Vars, V> = Rc<dyn Fn(Vars, AbortSignal) -> LocalBoxFuture<'static, Result<V, QueryError>>>;

slotmap::new_key_type! {
    struct ExecutionKey;
    struct ListenerKey;
}

/// Keyless remote write. Calls are never deduplicated: every call runs the mutation function once
/// with its own abort signal, and the latest call owns the visible state.
pub struct Mutation<Vars, V> {
    inner: Rc<MutationInner<Vars, V>>,
}

impl<Vars, V> Clone for Mutation<Vars, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct MutationInner<Vars, V> {
    mutation_fn: MutationFn<Vars, V>,
    options: MutationOptions<Vars, V>,
    state: RefCell<MutationState<V>>,
    generation: Cell<u64>,
    executions: RefCell<SlotMap<ExecutionKey, AbortController>>,
    listeners: RefCell<SlotMap<ListenerKey, Rc<dyn Fn()>>>,
}

impl<Vars, V> Mutation<Vars, V>
where
    Vars: Clone + 'static,
    V: crate::QueryValue + 'static,
{
    /// Creates a mutation around `mutation_fn`.
    pub fn new<Fu>(
        mutation_fn: impl Fn(Vars, AbortSignal) -> Fu + 'static,
        options: MutationOptions<Vars, V>,
    ) -> Self
    where
        Fu: Future<Output = Result<V, QueryError>> + 'static,
    {
        Self {
            inner: Rc::new(MutationInner {
                mutation_fn: Rc::new(move |vars, signal| mutation_fn(vars, signal).boxed_local()),
                options,
                state: RefCell::new(MutationState::default()),
                generation: Cell::new(0),
                executions: RefCell::new(SlotMap::with_key()),
                listeners: RefCell::new(SlotMap::with_key()),
            }),
        }
    }

    /// Snapshot of the visible state.
    pub fn state(&self) -> MutationState<V> {
        self.inner.state.try_borrow().expect("state borrow").clone()
    }

    /// Number of calls still in flight.
    pub fn in_flight(&self) -> usize {
        self.inner
            .executions
            .try_borrow()
            .expect("in_flight borrow")
            .len()
    }

    /// Registers `listener` for state changes. The returned closure unsubscribes.
    pub fn subscribe(&self, listener: impl Fn() + 'static) -> impl FnOnce() + 'static {
        let key = self
            .inner
            .listeners
            .try_borrow_mut()
            .expect("subscribe borrow_mut")
            .insert(Rc::new(listener));
        let inner = Rc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .listeners
                    .try_borrow_mut()
                    .expect("unsubscribe borrow_mut")
                    .remove(key);
            }
        }
    }

    /// Runs the mutation in the background.
    pub fn mutate(&self, vars: Vars) {
        let mutation = self.clone();
        crate::spawn_local(async move {
            let _ = mutation.mutate_async(vars).await;
        });
    }

    /// Runs the mutation and returns its result.
    ///
    /// A cancelled call resolves to [`QueryError::Cancelled`] without touching the state or
    /// invoking callbacks.
    pub async fn mutate_async(&self, vars: Vars) -> Result<V, QueryError> {
        let generation = self.next_generation();
        let controller = AbortController::new();
        let signal = controller.signal();
        let execution = self
            .inner
            .executions
            .try_borrow_mut()
            .expect("mutate_async borrow_mut")
            .insert(controller);

        self.write_state(generation, |state| {
            state.status = MutationStatus::Loading;
            state.error = None;
        });

        let fut = (self.inner.mutation_fn)(vars.clone(), signal.clone());
        let result = match run_abortable(&signal, fut).await {
            Ok(result) if !signal.is_aborted() => result,
            _ => Err(QueryError::Cancelled),
        };

        self.inner
            .executions
            .try_borrow_mut()
            .expect("mutate_async borrow_mut")
            .remove(execution);

        if matches!(result, Err(ref error) if error.is_cancelled()) {
            logging::debug_warn!("Mutation call was cancelled.");
            return Err(QueryError::Cancelled);
        }

        match &result {
            Ok(data) => {
                self.write_state(generation, |state| {
                    state.status = MutationStatus::Success;
                    state.data = Some(data.clone());
                    state.error = None;
                });
                if let Some(on_success) = &self.inner.options.on_success {
                    on_success(data, &vars);
                }
            }
            Err(error) => {
                self.write_state(generation, |state| {
                    state.status = MutationStatus::Error;
                    state.error = Some(error.clone());
                });
                if let Some(on_error) = &self.inner.options.on_error {
                    on_error(error, &vars);
                }
            }
        }
        if let Some(on_settled) = &self.inner.options.on_settled {
            on_settled(result.as_ref(), &vars);
        }
        result
    }

    /// Returns to idle and clears data and error. Calls still in flight no longer write state.
    pub fn reset(&self) {
        self.next_generation();
        self.replace_state(MutationState::default());
    }

    /// Aborts every call in flight. Returns true if any was aborted.
    pub fn cancel(&self) -> bool {
        let controllers = self
            .inner
            .executions
            .try_borrow_mut()
            .expect("cancel borrow_mut")
            .drain()
            .map(|(_, controller)| controller)
            .collect::<Vec<_>>();
        if controllers.is_empty() {
            return false;
        }
        for controller in &controllers {
            controller.abort();
        }

        self.next_generation();
        let was_loading = self.state().status == MutationStatus::Loading;
        if was_loading {
            let mut state = self.state();
            state.status = if state.error.is_some() {
                MutationStatus::Error
            } else if state.data.is_some() {
                MutationStatus::Success
            } else {
                MutationStatus::Idle
            };
            self.replace_state(state);
        }
        true
    }

    fn next_generation(&self) -> u64 {
        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);
        generation
    }

    fn write_state(&self, generation: u64, update: impl FnOnce(&mut MutationState<V>)) {
        // Only the latest call owns the visible state.
        if generation != self.inner.generation.get() {
            return;
        }
        update(&mut self.inner.state.try_borrow_mut().expect("write_state borrow_mut"));
        self.notify();
    }

    fn replace_state(&self, state: MutationState<V>) {
        *self
            .inner
            .state
            .try_borrow_mut()
            .expect("replace_state borrow_mut") = state;
        self.notify();
    }

    fn notify(&self) {
        let listeners = self
            .inner
            .listeners
            .try_borrow()
            .expect("notify borrow")
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            listener();
        }
    }
}

/// Reactive mutation result.
pub struct MutationResult<Vars, V>
where
    Vars: 'static,
    V: 'static,
{
    /// Result of the latest successful call.
    pub data: Signal<Option<V>>,
    /// Error of the latest failed call.
    pub error: Signal<Option<QueryError>>,
    /// Current status.
    pub status: Signal<MutationStatus>,
    /// Nothing has run since creation or reset.
    pub is_idle: Signal<bool>,
    /// The latest call is in flight.
    pub is_loading: Signal<bool>,
    /// The latest call succeeded.
    pub is_success: Signal<bool>,
    /// The latest call failed.
    pub is_error: Signal<bool>,
    mutation: Mutation<Vars, V>,
}

impl<Vars, V> Clone for MutationResult<Vars, V> {
    fn clone(&self) -> Self {
        Self {
            data: self.data,
            error: self.error,
            status: self.status,
            is_idle: self.is_idle,
            is_loading: self.is_loading,
            is_success: self.is_success,
            is_error: self.is_error,
            mutation: self.mutation.clone(),
        }
    }
}

impl<Vars, V> MutationResult<Vars, V>
where
    Vars: Clone + 'static,
    V: crate::QueryValue + 'static,
{
    /// See [`Mutation::mutate`].
    pub fn mutate(&self, vars: Vars) {
        self.mutation.mutate(vars)
    }

    /// See [`Mutation::mutate_async`].
    pub async fn mutate_async(&self, vars: Vars) -> Result<V, QueryError> {
        self.mutation.mutate_async(vars).await
    }

    /// See [`Mutation::reset`].
    pub fn reset(&self) {
        self.mutation.reset()
    }

    /// See [`Mutation::cancel`].
    pub fn cancel(&self) -> bool {
        self.mutation.cancel()
    }
}

/// Creates a mutation bound to the current reactive scope.
///
/// Every call in flight is aborted when the scope is cleaned up.
pub fn use_fme_mutation<Vars, V, Fu>(
    mutation_fn: impl Fn(Vars, AbortSignal) -> Fu + 'static,
    options: MutationOptions<Vars, V>,
) -> MutationResult<Vars, V>
where
    Vars: Clone + 'static,
    V: crate::QueryValue + 'static,
    Fu: Future<Output = Result<V, QueryError>> + 'static,
{
    let mutation = Mutation::new(mutation_fn, options);
    let state = create_rw_signal(MutationState::<V>::default());

    let unsubscribe = mutation.subscribe({
        let inner = Rc::downgrade(&mutation.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                state.set(Mutation { inner }.state());
            }
        }
    });

    on_cleanup({
        let mutation = mutation.clone();
        move || {
            unsubscribe();
            mutation.cancel();
        }
    });

    MutationResult {
        data: Signal::derive(move || state.with(|state| state.data.clone())),
        error: Signal::derive(move || state.with(|state| state.error.clone())),
        status: Signal::derive(move || state.with(|state| state.status)),
        is_idle: Signal::derive(move || state.with(|state| state.status == MutationStatus::Idle)),
        is_loading: Signal::derive(move || {
            state.with(|state| state.status == MutationStatus::Loading)
        }),
        is_success: Signal::derive(move || {
            state.with(|state| state.status == MutationStatus::Success)
        }),
        is_error: Signal::derive(move || state.with(|state| state.status == MutationStatus::Error)),
        mutation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::LocalSet;

    fn delayed_double(
        calls: &Rc<Cell<u32>>,
    ) -> impl Fn(u32, AbortSignal) -> LocalBoxFuture<'static, Result<u32, QueryError>> {
        let calls = calls.clone();
        move |value, _| {
            calls.set(calls.get() + 1);
            async move {
                crate::sleep(Duration::from_millis(100 * u64::from(value))).await;
                if value == 0 {
                    Err(QueryError::Http {
                        status: 422,
                        message: "invalid".into(),
                    })
                } else {
                    Ok(value * 2)
                }
            }
            .boxed_local()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_call_runs_once() {
        let calls = Rc::new(Cell::new(0));
        let mutation = Mutation::new(delayed_double(&calls), MutationOptions::default());

        let (a, b) = futures::join!(mutation.mutate_async(1), mutation.mutate_async(1));
        assert_eq!(a, Ok(2));
        assert_eq!(b, Ok(2));
        assert_eq!(calls.get(), 2, "mutations are never deduplicated");
        assert_eq!(mutation.state().status, MutationStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_call_owns_state() {
        let calls = Rc::new(Cell::new(0));
        let mutation = Mutation::new(delayed_double(&calls), MutationOptions::default());

        // The slow first call settles after the second one.
        let (slow, fast) = futures::join!(mutation.mutate_async(3), mutation.mutate_async(1));
        assert_eq!(slow, Ok(6));
        assert_eq!(fast, Ok(2));
        assert_eq!(mutation.state().data, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_and_callbacks() {
        let errors = Rc::new(Cell::new(0));
        let settled = Rc::new(Cell::new(0));
        let calls = Rc::new(Cell::new(0));
        let options = MutationOptions::default()
            .on_error({
                let errors = errors.clone();
                move |_: &QueryError, _: &u32| errors.set(errors.get() + 1)
            })
            .on_settled({
                let settled = settled.clone();
                move |_: Result<&u32, &QueryError>, _: &u32| settled.set(settled.get() + 1)
            });
        let mutation = Mutation::new(delayed_double(&calls), options);

        let result = mutation.mutate_async(0).await;
        assert!(matches!(result, Err(QueryError::Http { status: 422, .. })));
        assert_eq!(mutation.state().status, MutationStatus::Error);
        assert_eq!(errors.get(), 1);
        assert_eq!(settled.get(), 1);

        mutation.reset();
        assert_eq!(mutation.state(), MutationState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_ignores_stale_completion() {
        let calls = Rc::new(Cell::new(0));
        let mutation = Mutation::new(delayed_double(&calls), MutationOptions::default());

        let call = mutation.mutate_async(2);
        let reset = async {
            crate::sleep(Duration::from_millis(50)).await;
            mutation.reset();
        };
        let (result, _) = futures::join!(call, reset);

        assert_eq!(result, Ok(4));
        assert_eq!(mutation.state(), MutationState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_skips_callbacks() {
        let errors = Rc::new(Cell::new(0));
        let settled = Rc::new(Cell::new(0));
        let calls = Rc::new(Cell::new(0));
        let options = MutationOptions::default()
            .on_error({
                let errors = errors.clone();
                move |_: &QueryError, _: &u32| errors.set(errors.get() + 1)
            })
            .on_settled({
                let settled = settled.clone();
                move |_: Result<&u32, &QueryError>, _: &u32| settled.set(settled.get() + 1)
            });
        let mutation = Mutation::new(delayed_double(&calls), options);

        let call = mutation.mutate_async(5);
        let cancel = async {
            crate::sleep(Duration::from_millis(50)).await;
            assert_eq!(mutation.in_flight(), 1);
            assert!(mutation.cancel());
        };
        let (result, _) = futures::join!(call, cancel);

        assert_eq!(result, Err(QueryError::Cancelled));
        assert_eq!(errors.get(), 0);
        assert_eq!(settled.get(), 0);
        assert_eq!(mutation.state().status, MutationStatus::Idle);
        assert_eq!(mutation.in_flight(), 0);
        assert!(!mutation.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn hook_exposes_signals() {
        LocalSet::new()
            .run_until(async {
                let runtime = create_runtime();
                let calls = Rc::new(Cell::new(0));
                let result = use_fme_mutation(delayed_double(&calls), MutationOptions::default());
                assert!(result.is_idle.get_untracked());

                result.mutate(1);
                crate::sleep(Duration::from_millis(10)).await;
                assert!(result.is_loading.get_untracked());

                crate::sleep(Duration::from_millis(100)).await;
                assert!(result.is_success.get_untracked());
                assert_eq!(result.data.get_untracked(), Some(2));

                result.reset();
                assert!(result.is_idle.get_untracked());
                assert_eq!(result.data.get_untracked(), None);

                runtime.dispose();
            })
            .await;
    }
}
