use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use futures::future::join_all;
use serde_json::{Map, Value};
use smol_str::SmolStr;

use crate::debounce::Debouncer;
use crate::rule::{BoxedRuleFuture, Rule, RuleEval, RuleOutcome};

/// Tri-state validity: `Unknown` before the first validation and while an
/// async batch is outstanding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validity {
    Valid,
    Invalid,
    Unknown,
}

impl Validity {
    pub fn as_option(self) -> Option<bool> {
        match self {
            Validity::Valid => Some(true),
            Validity::Invalid => Some(false),
            Validity::Unknown => None,
        }
    }

    pub fn from_option(valid: Option<bool>) -> Self {
        match valid {
            Some(true) => Validity::Valid,
            Some(false) => Validity::Invalid,
            None => Validity::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldConfig {
    pub name: String,
    pub debounce: Duration,
    pub error_message: String,
    pub validate_on_mount: bool,
}

impl FieldConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            debounce: Duration::ZERO,
            error_message: "Invalid data".to_owned(),
            validate_on_mount: false,
        }
    }

    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = delay;
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn validate_on_mount(mut self, on: bool) -> Self {
        self.validate_on_mount = on;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldError {
    StatePoisoned(&'static str),
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldError::StatePoisoned(context) => {
                write!(f, "field state lock poisoned while {context}")
            }
        }
    }
}

impl std::error::Error for FieldError {}

pub type FieldResult<T> = Result<T, FieldError>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventTarget {
    pub value: Value,
}

/// Synthetic change event delivered to the registered change handler. The
/// value is set on both targets for symmetry with native UI events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeEvent {
    pub current_target: EventTarget,
    pub target: EventTarget,
    pub meta: Map<String, Value>,
}

impl ChangeEvent {
    fn for_value(value: Value, meta: Map<String, Value>) -> Self {
        Self {
            current_target: EventTarget {
                value: value.clone(),
            },
            target: EventTarget { value },
            meta,
        }
    }
}

type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct FieldState {
    value: Value,
    validity: Validity,
    message: Option<String>,
    error_key: Option<SmolStr>,
    visible: bool,
    processing: bool,
}

impl FieldState {
    fn initial(validity: Validity) -> Self {
        Self {
            value: Value::Null,
            validity,
            message: None,
            error_key: None,
            visible: false,
            processing: false,
        }
    }
}

/// A queued member of the async batch: either a rule whose evaluation is
/// deferred until the batch fires, or a future a sync sweep already produced.
enum QueuedRule {
    Deferred(Rule),
    Started(BoxedRuleFuture),
}

/// Owns one field's value/validity lifecycle. Value, validity, message and
/// error key are delegated to the attached [`crate::FormStore`] when present;
/// error visibility and the processing flag always stay local.
#[derive(Clone)]
pub struct FieldController {
    config: FieldConfig,
    rules: Arc<Vec<Rule>>,
    store: Option<crate::store::FormStore>,
    state: Arc<RwLock<FieldState>>,
    visibility: Debouncer,
    async_trigger: Debouncer,
    generation: Arc<AtomicU64>,
    on_change: Arc<RwLock<Option<ChangeHandler>>>,
}

impl FieldController {
    pub fn new(config: FieldConfig, rules: Vec<Rule>) -> Self {
        Self::build(config, rules, None)
    }

    /// Registers the field with `store` and delegates value/validity state to
    /// it. The store reference is injected here; there is no ambient lookup.
    pub fn with_store(
        config: FieldConfig,
        rules: Vec<Rule>,
        store: crate::store::FormStore,
    ) -> FieldResult<Self> {
        store.register(&config.name)?;
        let controller = Self::build(config, rules, Some(store));
        if controller.rules.is_empty() {
            controller.set_validity(Validity::Valid, None, None)?;
        }
        Ok(controller)
    }

    fn build(config: FieldConfig, rules: Vec<Rule>, store: Option<crate::store::FormStore>) -> Self {
        let delay = config.debounce;
        // a field with no rules can never fail, so it is born valid
        let validity = if rules.is_empty() {
            Validity::Valid
        } else {
            Validity::Unknown
        };
        Self {
            config,
            rules: Arc::new(rules),
            store,
            state: Arc::new(RwLock::new(FieldState::initial(validity))),
            visibility: Debouncer::new(delay),
            async_trigger: Debouncer::new(delay),
            generation: Arc::new(AtomicU64::new(0)),
            on_change: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&crate::store::FormStore> {
        self.store.as_ref()
    }

    pub fn on_change(&self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> FieldResult<()> {
        *write_lock(&self.on_change, "registering change handler")? = Some(Arc::new(handler));
        Ok(())
    }

    /// Runs the mount-time validation pass when `validate_on_mount` is set;
    /// its result bypasses the visibility debounce.
    pub async fn mount(&self) -> FieldResult<()> {
        if self.config.validate_on_mount {
            let _ = self.validate(None, true).await?;
        }
        Ok(())
    }

    /// Discards all pending work: both debounce windows are cancelled and the
    /// current generation is retired, so in-flight batches finalize nothing.
    pub fn unmount(&self) {
        self.visibility.cancel();
        self.retire_async_work();
        log::trace!("field `{}` unmounted", self.config.name);
    }

    pub fn get_value(&self) -> FieldResult<Value> {
        match &self.store {
            Some(store) => store.get_value(&self.config.name),
            None => Ok(read_lock(&self.state, "reading field value")?.value.clone()),
        }
    }

    /// Writes the value, optimistically hides any shown error, notifies the
    /// change handler with a synthetic event, and re-validates.
    pub async fn set_value(
        &self,
        value: Value,
        meta: Option<Map<String, Value>>,
    ) -> FieldResult<Option<bool>> {
        self.write_value(value.clone())?;
        self.hide_error()?;

        let handler = read_lock(&self.on_change, "reading change handler")?.clone();
        if let Some(handler) = handler {
            let event = ChangeEvent::for_value(value.clone(), meta.unwrap_or_default());
            handler(&event);
        }

        self.validate(Some(value), false).await
    }

    /// Runs the rule pipeline for `value` (current value when `None`).
    ///
    /// Returns `Some(verdict)` when this call finalized the field, `None` when
    /// it was superseded by a newer call before its async batch could run or
    /// finalize. `ignore_debounce` surfaces a failure without the visibility
    /// delay.
    pub async fn validate(
        &self,
        value: Option<Value>,
        ignore_debounce: bool,
    ) -> FieldResult<Option<bool>> {
        let value = match value {
            Some(value) => value,
            None => self.get_value()?,
        };

        if self.rules.is_empty() {
            self.retire_async_work();
            self.finalize(Validity::Valid, None, None)?;
            self.hide_error()?;
            return Ok(Some(true));
        }

        let all = self.all_values(&value)?;

        let mut queued: Vec<QueuedRule> = Vec::new();
        let mut failure: Option<(RuleOutcome, bool)> = None;

        for rule in self.rules.iter() {
            if rule.forces_async() {
                queued.push(QueuedRule::Deferred(rule.clone()));
                continue;
            }
            match (rule.evaluate)(rule.input(value.clone(), all.clone())) {
                RuleEval::Pending(future) => {
                    // a sync rule that produced a future joins the async batch
                    queued.push(QueuedRule::Started(future));
                }
                RuleEval::Ready(verdict) => {
                    let outcome = verdict.normalize(&self.config.error_message);
                    if !outcome.valid {
                        // short-circuit: later sync rules never run, later
                        // async rules never queue
                        failure = Some((outcome, rule.skips_debounce));
                        break;
                    }
                }
            }
        }

        if let Some((outcome, skips_debounce)) = failure {
            self.retire_async_work();
            self.finalize(Validity::Invalid, outcome.message, outcome.key)?;
            self.show_error(ignore_debounce || skips_debounce)?;
            return Ok(Some(false));
        }

        if queued.is_empty() {
            self.retire_async_work();
            self.finalize(Validity::Valid, None, None)?;
            self.hide_error()?;
            return Ok(Some(true));
        }

        self.run_async_batch(queued, value, all).await
    }

    /// The async half of the pipeline: provisional `Unknown`, trailing-edge
    /// debounce on the trigger, then run every queued rule concurrently.
    async fn run_async_batch(
        &self,
        queued: Vec<QueuedRule>,
        value: Value,
        all: BTreeMap<String, Value>,
    ) -> FieldResult<Option<bool>> {
        self.set_validity(Validity::Unknown, None, None)?;
        self.hide_error()?;

        let ticket = self.async_trigger.arm();
        if !self.async_trigger.wait(ticket).await {
            // a newer validate() claimed the window; this batch never runs
            return Ok(None);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_processing(true)?;

        let futures = queued
            .into_iter()
            .map(|entry| match entry {
                QueuedRule::Started(future) => future,
                QueuedRule::Deferred(rule) => {
                    match (rule.evaluate)(rule.input(value.clone(), all.clone())) {
                        RuleEval::Ready(verdict) => {
                            let settled: BoxedRuleFuture = Box::pin(std::future::ready(Ok(verdict)));
                            settled
                        }
                        RuleEval::Pending(future) => future,
                    }
                }
            })
            .collect::<Vec<_>>();

        let results = join_all(futures).await;

        let mut valid = true;
        let mut message = None;
        let mut key = None;
        for result in results {
            let outcome = match result {
                Ok(verdict) => verdict.normalize(&self.config.error_message),
                Err(rejection) => RuleOutcome {
                    valid: false,
                    message: rejection
                        .message
                        .or_else(|| Some(self.config.error_message.clone())),
                    key: None,
                },
            };
            // AND aggregation; the first invalid result in list order wins
            if !outcome.valid && valid {
                valid = false;
                message = outcome.message;
                key = outcome.key;
            }
        }

        if self.generation.load(Ordering::SeqCst) != generation {
            // a newer batch owns the field; discard this result silently
            return Ok(None);
        }

        if valid {
            self.finalize(Validity::Valid, None, None)?;
            self.hide_error()?;
        } else {
            self.finalize(Validity::Invalid, message, key)?;
            // async completions already waited out their own debounce
            self.show_error(true)?;
        }
        Ok(Some(valid))
    }

    /// Tri-state validity. `None` while the verdict is unknown and no error is
    /// shown; a forced-visible unknown degrades to `Some(false)` for display.
    pub fn is_valid(&self) -> FieldResult<Option<bool>> {
        let validity = self.current_validity()?;
        let visible = read_lock(&self.state, "reading error visibility")?.visible;
        Ok(match validity {
            Validity::Valid => Some(true),
            Validity::Invalid => Some(false),
            Validity::Unknown if visible => Some(false),
            Validity::Unknown => None,
        })
    }

    pub fn is_processing(&self) -> FieldResult<bool> {
        Ok(read_lock(&self.state, "reading processing flag")?.processing)
    }

    /// Current error text, or `None` while the error is not yet visible.
    pub fn error(&self) -> FieldResult<Option<String>> {
        if !read_lock(&self.state, "reading error visibility")?.visible {
            return Ok(None);
        }
        match &self.store {
            Some(store) => store.get_error(&self.config.name),
            None => Ok(read_lock(&self.state, "reading error message")?.message.clone()),
        }
    }

    /// Machine-readable discriminator of the failing rule, gated by the same
    /// visibility as [`FieldController::error`].
    pub fn error_key(&self) -> FieldResult<Option<SmolStr>> {
        if !read_lock(&self.state, "reading error visibility")?.visible {
            return Ok(None);
        }
        match &self.store {
            Some(store) => store.get_error_key(&self.config.name),
            None => Ok(read_lock(&self.state, "reading error key")?.error_key.clone()),
        }
    }

    fn current_validity(&self) -> FieldResult<Validity> {
        match &self.store {
            Some(store) => Ok(Validity::from_option(
                store.is_field_valid(&self.config.name)?,
            )),
            None => Ok(read_lock(&self.state, "reading field validity")?.validity),
        }
    }

    fn all_values(&self, own: &Value) -> FieldResult<BTreeMap<String, Value>> {
        match &self.store {
            Some(store) => store.all_values(),
            None => Ok(BTreeMap::from([(self.config.name.clone(), own.clone())])),
        }
    }

    fn write_value(&self, value: Value) -> FieldResult<()> {
        match &self.store {
            Some(store) => store.set_value(&self.config.name, value),
            None => {
                write_lock(&self.state, "writing field value")?.value = value;
                Ok(())
            }
        }
    }

    fn set_validity(
        &self,
        validity: Validity,
        message: Option<String>,
        key: Option<SmolStr>,
    ) -> FieldResult<()> {
        match &self.store {
            Some(store) => {
                store.set_valid(&self.config.name, validity.as_option(), message, key)
            }
            None => {
                let mut state = write_lock(&self.state, "writing field validity")?;
                state.validity = validity;
                if validity == Validity::Invalid {
                    state.message = message;
                    state.error_key = key;
                } else {
                    state.message = None;
                    state.error_key = None;
                }
                Ok(())
            }
        }
    }

    fn finalize(
        &self,
        validity: Validity,
        message: Option<String>,
        key: Option<SmolStr>,
    ) -> FieldResult<()> {
        self.set_processing(false)?;
        self.set_validity(validity, message, key)
    }

    /// A synchronous verdict supersedes any older async work: the trigger
    /// window is cancelled so an armed batch never starts, and the generation
    /// is retired so an in-flight batch finalizes nothing.
    fn retire_async_work(&self) {
        self.async_trigger.cancel();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn set_processing(&self, processing: bool) -> FieldResult<()> {
        write_lock(&self.state, "writing processing flag")?.processing = processing;
        Ok(())
    }

    /// Hiding is always immediate and cancels any pending debounced show.
    fn hide_error(&self) -> FieldResult<()> {
        self.visibility.cancel();
        write_lock(&self.state, "hiding field error")?.visible = false;
        Ok(())
    }

    /// Showing goes through the visibility debouncer unless `immediate`. The
    /// debounced wait rides a detached watcher thread, so the caller's verdict
    /// resolves before the error becomes visible.
    fn show_error(&self, immediate: bool) -> FieldResult<()> {
        if immediate || self.visibility.delay().is_zero() {
            self.visibility.cancel();
            write_lock(&self.state, "showing field error")?.visible = true;
            return Ok(());
        }
        let ticket = self.visibility.arm();
        let visibility = self.visibility.clone();
        let state = Arc::clone(&self.state);
        thread::spawn(move || {
            if block_on(visibility.wait(ticket)) {
                let mut state = match state.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                state.visible = true;
            }
        });
        Ok(())
    }
}

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FieldResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FieldError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FieldResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FieldError::StatePoisoned(context))
}
