use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::debounce::Debouncer;
use crate::schema::{self, FieldLens, Schema, ValidationError};

static FORM_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(pub u64);

impl FormId {
    pub fn next() -> Self {
        Self(FORM_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldKey(&'static str);

impl FieldKey {
    pub const fn new(value: &'static str) -> Self {
        Self(value)
    }

    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl Display for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FormOptions {
    pub validate_on_change: bool,
    pub validate_on_blur: bool,
    pub debounce: Duration,
    pub reset_on_submit: bool,
    pub focus_on_error: bool,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            validate_on_change: true,
            validate_on_blur: true,
            debounce: Duration::from_millis(300),
            reset_on_submit: false,
            focus_on_error: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldMeta<E> {
    pub dirty: bool,
    pub touched: bool,
    pub errors: Vec<E>,
}

impl<E> Default for FieldMeta<E> {
    fn default() -> Self {
        Self {
            dirty: false,
            touched: false,
            errors: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FormSnapshot<T, E> {
    pub model: T,
    pub submit_state: SubmitState,
    pub submit_count: u32,
    pub is_dirty: bool,
    pub is_valid: bool,
    pub is_submitting: bool,
    pub field_meta: BTreeMap<FieldKey, FieldMeta<E>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FormError {
    StatePoisoned(&'static str),
    InvalidStateTransition { from: SubmitState, to: SubmitState },
    AlreadySubmitting,
    SubmitFailed(String),
    DraftLoadFailed(String),
    DraftSaveFailed(String),
    DraftClearFailed(String),
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::StatePoisoned(context) => {
                write!(f, "form state lock poisoned while {context}")
            }
            FormError::InvalidStateTransition { from, to } => {
                write!(f, "invalid submit state transition: {from:?} -> {to:?}")
            }
            FormError::AlreadySubmitting => f.write_str("form submit is already in progress"),
            FormError::SubmitFailed(error) => write!(f, "submit handler failed: {error}"),
            FormError::DraftLoadFailed(error) => write!(f, "failed to load draft: {error}"),
            FormError::DraftSaveFailed(error) => write!(f, "failed to save draft: {error}"),
            FormError::DraftClearFailed(error) => write!(f, "failed to clear draft: {error}"),
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

pub(crate) type FocusHandlerFn = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ValidationSubscriberFn<E> =
    Arc<dyn Fn(bool, &BTreeMap<FieldKey, E>) + Send + Sync>;
pub(crate) type AutoSaveFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct AutoSaveEntry<T> {
    pub(crate) timer: Debouncer,
    pub(crate) callback: AutoSaveFn<T>,
}

pub(crate) struct FormState<T, E> {
    pub(crate) id: FormId,
    pub(crate) initial_model: T,
    pub(crate) model: T,
    pub(crate) submit_state: SubmitState,
    pub(crate) submit_count: u32,
    pub(crate) dirty_fields: BTreeSet<FieldKey>,
    pub(crate) field_meta: BTreeMap<FieldKey, FieldMeta<E>>,
    pub(crate) first_error: Option<FieldKey>,
    pub(crate) disposed: bool,
}

impl<T, E> FormState<T, E> {
    pub(crate) fn ensure_meta(&mut self, key: FieldKey) -> &mut FieldMeta<E> {
        self.field_meta.entry(key).or_default()
    }
}

#[derive(Clone)]
pub struct FormController<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: ValidationError,
{
    pub(crate) options: FormOptions,
    pub(crate) schema: Arc<dyn Schema<T, Error = E>>,
    pub(crate) state: Arc<RwLock<FormState<T, E>>>,
    pub(crate) debouncer: Debouncer,
    pub(crate) auto_save: Arc<RwLock<Option<AutoSaveEntry<T>>>>,
    pub(crate) focus_handlers: Arc<RwLock<BTreeMap<FieldKey, FocusHandlerFn>>>,
    pub(crate) required_fields: Arc<RwLock<BTreeSet<FieldKey>>>,
    pub(crate) field_descriptions: Arc<RwLock<BTreeMap<FieldKey, Cow<'static, str>>>>,
    pub(crate) validation_subscribers: Arc<RwLock<Vec<ValidationSubscriberFn<E>>>>,
}

impl<T, E> FormController<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: ValidationError,
{
    pub fn new(
        initial: T,
        schema: impl Schema<T, Error = E> + 'static,
        options: FormOptions,
    ) -> Self {
        Self {
            debouncer: Debouncer::new(options.debounce),
            options,
            schema: Arc::new(schema),
            state: Arc::new(RwLock::new(FormState {
                id: FormId::next(),
                initial_model: initial.clone(),
                model: initial,
                submit_state: SubmitState::Idle,
                submit_count: 0,
                dirty_fields: BTreeSet::new(),
                field_meta: BTreeMap::new(),
                first_error: None,
                disposed: false,
            })),
            auto_save: Arc::new(RwLock::new(None)),
            focus_handlers: Arc::new(RwLock::new(BTreeMap::new())),
            required_fields: Arc::new(RwLock::new(BTreeSet::new())),
            field_descriptions: Arc::new(RwLock::new(BTreeMap::new())),
            validation_subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn form_id(&self) -> FormResult<FormId> {
        Ok(read_lock(&self.state, "reading form id")?.id)
    }

    pub fn options(&self) -> FormOptions {
        self.options
    }

    /// Replaces a field value and recomputes its dirty flag. An existing
    /// error on the field is cleared optimistically; the next debounce tick
    /// or blur re-validates it.
    pub fn set<L>(&self, lens: L, value: L::Value) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let key = lens.key();
        let mut state = write_lock(&self.state, "writing form model")?;
        lens.set(&mut state.model, value);
        let is_dirty = lens.get(&state.model) != lens.get(&state.initial_model);
        if is_dirty {
            state.dirty_fields.insert(key);
        } else {
            state.dirty_fields.remove(&key);
        }
        {
            let meta = state.ensure_meta(key);
            meta.dirty = is_dirty;
            meta.errors.clear();
        }
        state.first_error = first_error_key(&state.field_meta);
        Ok(())
    }

    pub fn value<L>(&self, lens: L) -> FormResult<L::Value>
    where
        L: FieldLens<T>,
    {
        Ok(lens
            .get(&read_lock(&self.state, "reading field value")?.model)
            .clone())
    }

    /// Marks a field touched. Touched is monotonic until a reset. When
    /// `validate_on_blur` is set the field is validated immediately; blur
    /// validation never waits on the debounce window.
    pub fn touch<L>(&self, lens: L) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let key = lens.key();
        {
            let mut state = write_lock(&self.state, "touching field")?;
            state.ensure_meta(key).touched = true;
        }

        if self.options.validate_on_blur {
            let _ = self.validate_field_by_key(key)?;
        }
        Ok(())
    }

    pub fn validate_field<L>(&self, lens: L) -> FormResult<bool>
    where
        L: FieldLens<T>,
    {
        self.validate_field_by_key(lens.key())
    }

    pub(crate) fn validate_field_by_key(&self, key: FieldKey) -> FormResult<bool> {
        let model = {
            read_lock(&self.state, "reading model for field validation")?
                .model
                .clone()
        };
        let report = schema::evaluate(self.schema.as_ref(), &model);
        let errors = report.errors_for(key);
        let is_valid = errors.is_empty();

        {
            let mut state = write_lock(&self.state, "writing field validation result")?;
            state.ensure_meta(key).errors = errors;
            state.first_error = first_error_key(&state.field_meta);
        }
        self.notify_validation()?;
        Ok(is_valid)
    }

    /// Whole-form validation against the current model. Replaces `errors`
    /// wholesale, so stale errors for now-valid fields are cleared.
    pub fn validate_form(&self) -> FormResult<bool> {
        let model = {
            read_lock(&self.state, "reading model for form validation")?
                .model
                .clone()
        };
        let report = schema::evaluate(self.schema.as_ref(), &model);
        let is_valid = report.is_valid();
        let mut violations = report.into_violations();

        {
            let mut state = write_lock(&self.state, "applying form validation result")?;
            let mut keys = state
                .field_meta
                .keys()
                .copied()
                .collect::<BTreeSet<FieldKey>>();
            keys.extend(violations.keys().copied());
            for key in keys {
                let errors = violations.remove(&key).unwrap_or_default();
                state.ensure_meta(key).errors = errors;
            }
            state.first_error = first_error_key(&state.field_meta);
        }
        self.notify_validation()?;
        Ok(is_valid)
    }

    /// Arms the validation debouncer and, once the tick settles without being
    /// superseded, re-runs whole-form validation if `validate_on_change` is
    /// set and at least one field has been touched. Returns whether a
    /// validation pass ran.
    pub async fn revalidate_after_debounce(&self) -> FormResult<bool> {
        let ticket = self.debouncer.arm();
        if !self.debouncer.settle(ticket).await {
            return Ok(false);
        }
        if !self.options.validate_on_change {
            return Ok(false);
        }
        {
            let state = read_lock(&self.state, "checking debounced revalidation gate")?;
            if state.disposed || !state.field_meta.values().any(|meta| meta.touched) {
                return Ok(false);
            }
        }
        let _ = self.validate_form()?;
        Ok(true)
    }

    pub async fn set_debounced<L>(&self, lens: L, value: L::Value) -> FormResult<bool>
    where
        L: FieldLens<T>,
    {
        self.set(lens, value)?;
        self.revalidate_after_debounce().await
    }

    pub fn subscribe_validation(
        &self,
        subscriber: impl Fn(bool, &BTreeMap<FieldKey, E>) + Send + Sync + 'static,
    ) -> FormResult<()> {
        let mut subscribers =
            write_lock(&self.validation_subscribers, "subscribing to validation")?;
        subscribers.push(Arc::new(subscriber));
        Ok(())
    }

    fn notify_validation(&self) -> FormResult<()> {
        let (is_valid, field_errors) = {
            let state = read_lock(&self.state, "reading validation result for subscribers")?;
            let mut field_errors = BTreeMap::new();
            for (key, meta) in &state.field_meta {
                if let Some(error) = meta.errors.first() {
                    field_errors.insert(*key, error.clone());
                }
            }
            (field_errors.is_empty(), field_errors)
        };
        let subscribers = read_lock(&self.validation_subscribers, "reading subscribers")?.clone();
        for subscriber in subscribers {
            subscriber(is_valid, &field_errors);
        }
        Ok(())
    }

    pub fn configure_auto_save(
        &self,
        interval: Duration,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> FormResult<()> {
        let mut slot = write_lock(&self.auto_save, "configuring auto-save")?;
        *slot = Some(AutoSaveEntry {
            timer: Debouncer::new(interval),
            callback: Arc::new(callback),
        });
        Ok(())
    }

    /// One auto-save timer cycle. Armed per data change (each tick supersedes
    /// pending ones), fires only when the form is dirty and no submit is in
    /// flight. `is_submitting` is re-checked after the interval elapses, not
    /// merely at arm time. Returns whether the callback ran.
    pub async fn auto_save_tick(&self) -> FormResult<bool> {
        let entry = {
            let Some(entry) = read_lock(&self.auto_save, "reading auto-save entry")?.clone()
            else {
                return Ok(false);
            };
            entry
        };
        {
            let state = read_lock(&self.state, "checking auto-save arm gate")?;
            if state.disposed
                || state.submit_state == SubmitState::Submitting
                || state.dirty_fields.is_empty()
            {
                return Ok(false);
            }
        }

        let ticket = entry.timer.arm();
        if !entry.timer.settle(ticket).await {
            return Ok(false);
        }

        let model = {
            let state = read_lock(&self.state, "checking auto-save fire gate")?;
            if state.disposed || state.submit_state == SubmitState::Submitting {
                return Ok(false);
            }
            state.model.clone()
        };
        (entry.callback)(&model);
        Ok(true)
    }

    pub fn register_focus_handler<L>(
        &self,
        lens: L,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let mut handlers = write_lock(&self.focus_handlers, "registering focus handler")?;
        handlers.insert(lens.key(), Arc::new(handler));
        Ok(())
    }

    pub fn register_required_field<L>(&self, lens: L) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let mut required = write_lock(&self.required_fields, "registering required field")?;
        required.insert(lens.key());
        Ok(())
    }

    pub fn register_field_description<L>(
        &self,
        lens: L,
        description: impl Into<Cow<'static, str>>,
    ) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let mut descriptions =
            write_lock(&self.field_descriptions, "registering field description")?;
        descriptions.insert(lens.key(), description.into());
        Ok(())
    }

    pub fn submit(&self, handler: impl FnOnce(&T) -> FormResult<()>) -> FormResult<()> {
        let Some(model) = self.begin_submit()? else {
            return Ok(());
        };
        let submit_result = handler(&model);
        self.finish_submit(submit_result)
    }

    pub async fn submit_async<F, Fut>(&self, handler: F) -> FormResult<()>
    where
        F: FnOnce(&T) -> Fut,
        Fut: Future<Output = FormResult<()>> + Send,
    {
        let Some(model) = self.begin_submit()? else {
            return Ok(());
        };
        let submit_result = handler(&model).await;
        self.finish_submit(submit_result)
    }

    /// Guards the at-most-one-submission invariant, marks every known field
    /// touched, and validates against the latest model. Returns the model to
    /// hand to the submit handler, or `None` when validation failed (after
    /// focusing the first errored field when configured).
    fn begin_submit(&self) -> FormResult<Option<T>> {
        {
            let mut state = write_lock(&self.state, "preparing submit")?;
            if state.submit_state == SubmitState::Submitting {
                return Err(FormError::AlreadySubmitting);
            }
            transition_submit_state(&mut state, SubmitState::Validating)?;
            state.submit_count = state.submit_count.saturating_add(1);
        }

        self.mark_all_touched()?;
        let is_valid = self.validate_form()?;
        if !is_valid {
            {
                let mut state = write_lock(&self.state, "handling submit validation failure")?;
                transition_submit_state(&mut state, SubmitState::Failed)?;
            }
            if self.options.focus_on_error {
                let _ = self.focus_first_error()?;
            }
            return Ok(None);
        }

        let mut state = write_lock(&self.state, "moving submit state to submitting")?;
        transition_submit_state(&mut state, SubmitState::Submitting)?;
        Ok(Some(state.model.clone()))
    }

    /// The handler's error propagates unaltered, but the state machine always
    /// leaves `Submitting`. A result resolving after disposal is discarded.
    fn finish_submit(&self, submit_result: FormResult<()>) -> FormResult<()> {
        {
            let mut state = write_lock(&self.state, "completing submit")?;
            if state.disposed {
                return submit_result;
            }
            if submit_result.is_ok() {
                transition_submit_state(&mut state, SubmitState::Succeeded)?;
            } else {
                transition_submit_state(&mut state, SubmitState::Failed)?;
            }
        }
        if submit_result.is_ok() && self.options.reset_on_submit {
            self.reset_to_initial()?;
        }
        submit_result
    }

    fn mark_all_touched(&self) -> FormResult<()> {
        let mut keys = self.known_field_keys()?;
        keys.extend(self.schema.field_keys());
        let mut state = write_lock(&self.state, "marking all fields touched")?;
        for key in keys {
            state.ensure_meta(key).touched = true;
        }
        Ok(())
    }

    pub fn focus_first_error(&self) -> FormResult<bool> {
        let first_error = read_lock(&self.state, "reading first error key")?.first_error;
        let Some(key) = first_error else {
            return Ok(false);
        };
        let handler = read_lock(&self.focus_handlers, "reading focus handlers")?
            .get(&key)
            .cloned();
        if let Some(handler) = handler {
            handler();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn reset_to_initial(&self) -> FormResult<()> {
        let mut state = write_lock(&self.state, "resetting form")?;
        state.model = state.initial_model.clone();
        reset_state(&mut state);
        Ok(())
    }

    /// Resets and re-baselines the dirty comparison against `new_initial`.
    pub fn reset_with(&self, new_initial: T) -> FormResult<()> {
        let mut state = write_lock(&self.state, "resetting form with new baseline")?;
        state.initial_model = new_initial.clone();
        state.model = new_initial;
        reset_state(&mut state);
        Ok(())
    }

    pub fn reset_field<L>(&self, lens: L) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let key = lens.key();
        let mut state = write_lock(&self.state, "resetting field")?;
        let initial_value = lens.get(&state.initial_model).clone();
        lens.set(&mut state.model, initial_value);
        state.dirty_fields.remove(&key);
        {
            let meta = state.ensure_meta(key);
            meta.dirty = false;
            meta.touched = false;
            meta.errors.clear();
        }
        state.first_error = first_error_key(&state.field_meta);
        Ok(())
    }

    pub fn clear_errors(&self) -> FormResult<()> {
        let mut state = write_lock(&self.state, "clearing all field errors")?;
        for meta in state.field_meta.values_mut() {
            meta.errors.clear();
        }
        state.first_error = None;
        Ok(())
    }

    pub fn clear_field_errors<L>(&self, lens: L) -> FormResult<()>
    where
        L: FieldLens<T>,
    {
        let key = lens.key();
        let mut state = write_lock(&self.state, "clearing field errors")?;
        if let Some(meta) = state.field_meta.get_mut(&key) {
            meta.errors.clear();
        }
        state.first_error = first_error_key(&state.field_meta);
        Ok(())
    }

    /// Cancels both pending timers and marks the controller disposed. A
    /// submit already in flight is not cancelled; its result is discarded.
    pub fn dispose(&self) -> FormResult<()> {
        self.debouncer.cancel();
        {
            let auto_save = read_lock(&self.auto_save, "cancelling auto-save timer")?;
            if let Some(entry) = auto_save.as_ref() {
                entry.timer.cancel();
            }
        }
        let mut state = write_lock(&self.state, "disposing form")?;
        state.disposed = true;
        Ok(())
    }

    pub fn is_disposed(&self) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading disposed flag")?.disposed)
    }

    /// `is_valid` is a fresh whole-form validation of the current model, not
    /// `errors.is_empty()`; stored errors may be stale between passes.
    pub fn snapshot(&self) -> FormResult<FormSnapshot<T, E>> {
        let (model, submit_state, submit_count, is_dirty, field_meta) = {
            let state = read_lock(&self.state, "creating form snapshot")?;
            (
                state.model.clone(),
                state.submit_state,
                state.submit_count,
                !state.dirty_fields.is_empty(),
                state.field_meta.clone(),
            )
        };
        let is_valid = schema::evaluate(self.schema.as_ref(), &model).is_valid();
        Ok(FormSnapshot {
            model,
            submit_state,
            submit_count,
            is_dirty,
            is_valid,
            is_submitting: submit_state == SubmitState::Submitting,
            field_meta,
        })
    }

    pub fn field_meta<L>(&self, lens: L) -> FormResult<Option<FieldMeta<E>>>
    where
        L: FieldLens<T>,
    {
        Ok(read_lock(&self.state, "reading field meta")?
            .field_meta
            .get(&lens.key())
            .cloned())
    }

    pub fn field_description<L>(&self, lens: L) -> FormResult<Option<Cow<'static, str>>>
    where
        L: FieldLens<T>,
    {
        Ok(
            read_lock(&self.field_descriptions, "reading field description")?
                .get(&lens.key())
                .cloned(),
        )
    }

    pub fn is_required<L>(&self, lens: L) -> FormResult<bool>
    where
        L: FieldLens<T>,
    {
        Ok(read_lock(&self.required_fields, "reading required fields")?.contains(&lens.key()))
    }

    pub(crate) fn known_field_keys(&self) -> FormResult<BTreeSet<FieldKey>> {
        let mut keys = BTreeSet::new();
        keys.extend(
            read_lock(&self.focus_handlers, "reading focus handler keys")?
                .keys()
                .copied(),
        );
        keys.extend(
            read_lock(&self.required_fields, "reading required field keys")?
                .iter()
                .copied(),
        );
        keys.extend(
            read_lock(&self.field_descriptions, "reading description field keys")?
                .keys()
                .copied(),
        );
        keys.extend(
            read_lock(&self.state, "reading known keys from field metadata")?
                .field_meta
                .keys()
                .copied(),
        );
        Ok(keys)
    }
}

fn reset_state<T, E>(state: &mut FormState<T, E>) {
    state.submit_state = SubmitState::Idle;
    state.submit_count = 0;
    state.dirty_fields.clear();
    state.first_error = None;
    for meta in state.field_meta.values_mut() {
        meta.dirty = false;
        meta.touched = false;
        meta.errors.clear();
    }
}

pub(crate) fn transition_submit_state<T, E>(
    state: &mut FormState<T, E>,
    next: SubmitState,
) -> FormResult<()> {
    let current = state.submit_state;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (SubmitState::Idle, SubmitState::Validating)
            | (SubmitState::Validating, SubmitState::Submitting)
            | (SubmitState::Validating, SubmitState::Failed)
            | (SubmitState::Submitting, SubmitState::Succeeded)
            | (SubmitState::Submitting, SubmitState::Failed)
            | (SubmitState::Succeeded, SubmitState::Validating)
            | (SubmitState::Failed, SubmitState::Validating)
            | (_, SubmitState::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    state.submit_state = next;
    Ok(())
}

pub(crate) fn first_error_key<E>(
    field_meta: &BTreeMap<FieldKey, FieldMeta<E>>,
) -> Option<FieldKey> {
    field_meta
        .iter()
        .find_map(|(key, meta)| (!meta.errors.is_empty()).then_some(*key))
}

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
