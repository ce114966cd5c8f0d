use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use smol_str::SmolStr;

/// Caller-supplied parameters for one rule, merged into its invocation input.
pub type OptionMap = Map<String, Value>;

/// Everything a rule sees when invoked: the candidate value, a read-only
/// snapshot of all registered field values (for cross-field checks), and the
/// rule's own options.
#[derive(Clone, Debug, Default)]
pub struct RuleInput {
    pub value: Value,
    pub all: BTreeMap<String, Value>,
    pub options: OptionMap,
}

/// Full validation result. `message` and `key` are only meaningful on failure;
/// a failure without a message falls back to the field's configured default.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RuleOutcome {
    pub valid: bool,
    pub message: Option<String>,
    pub key: Option<SmolStr>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            valid: true,
            message: None,
            key: None,
        }
    }

    pub fn fail(message: impl Into<String>, key: impl Into<SmolStr>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
            key: Some(key.into()),
        }
    }
}

/// What a rule settles to: a bare pass/fail or a full outcome.
#[derive(Clone, Debug)]
pub enum RuleVerdict {
    Pass(bool),
    Outcome(RuleOutcome),
}

impl RuleVerdict {
    /// Normalizes to an outcome. Failures without a message receive
    /// `default_message`; successes carry neither message nor key.
    pub(crate) fn normalize(self, default_message: &str) -> RuleOutcome {
        match self {
            RuleVerdict::Pass(valid) => RuleOutcome {
                valid,
                message: (!valid).then(|| default_message.to_owned()),
                key: None,
            },
            RuleVerdict::Outcome(mut outcome) => {
                if outcome.valid {
                    outcome.message = None;
                    outcome.key = None;
                } else if outcome.message.is_none() {
                    outcome.message = Some(default_message.to_owned());
                }
                outcome
            }
        }
    }
}

impl From<bool> for RuleVerdict {
    fn from(valid: bool) -> Self {
        RuleVerdict::Pass(valid)
    }
}

impl From<RuleOutcome> for RuleVerdict {
    fn from(outcome: RuleOutcome) -> Self {
        RuleVerdict::Outcome(outcome)
    }
}

/// Failure raised by a rejected rule future. Carries a message only when the
/// rejection is outcome-shaped; otherwise the field's default message applies.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RuleRejection {
    pub message: Option<String>,
}

impl RuleRejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    pub fn opaque() -> Self {
        Self { message: None }
    }
}

pub type BoxedRuleFuture =
    Pin<Box<dyn Future<Output = Result<RuleVerdict, RuleRejection>> + Send + 'static>>;

/// A single evaluation: either settled on the spot or still pending. A rule
/// not flagged asynchronous that returns `Pending` is reclassified into the
/// async batch by the controller.
pub enum RuleEval {
    Ready(RuleVerdict),
    Pending(BoxedRuleFuture),
}

pub(crate) type RuleFn = Arc<dyn Fn(RuleInput) -> RuleEval + Send + Sync>;

/// One validator in a field's ordered rule list.
#[derive(Clone)]
pub struct Rule {
    pub(crate) evaluate: RuleFn,
    pub(crate) options: OptionMap,
    pub(crate) is_async: bool,
    pub(crate) skips_debounce: bool,
}

impl Rule {
    pub fn new(evaluate: impl Fn(RuleInput) -> RuleEval + Send + Sync + 'static) -> Self {
        Self {
            evaluate: Arc::new(evaluate),
            options: OptionMap::new(),
            is_async: false,
            skips_debounce: false,
        }
    }

    /// Convenience for rules that always settle synchronously.
    pub fn sync<V>(evaluate: impl Fn(RuleInput) -> V + Send + Sync + 'static) -> Self
    where
        V: Into<RuleVerdict>,
    {
        Self::new(move |input| RuleEval::Ready(evaluate(input).into()))
    }

    /// Convenience for rules that always produce a future.
    pub fn future(evaluate: impl Fn(RuleInput) -> BoxedRuleFuture + Send + Sync + 'static) -> Self {
        Self::new(move |input| RuleEval::Pending(evaluate(input)))
    }

    pub fn with_options(mut self, options: OptionMap) -> Self {
        if options.contains_key("value") || options.contains_key("all") {
            // the invocation input always wins; a same-named option never
            // reaches the rule
            log::warn!("rule options named `value` or `all` are shadowed by the validation input");
        }
        self.options = options;
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key == "value" || key == "all" {
            log::warn!("rule option `{key}` is shadowed by the validation input");
        }
        self.options.insert(key, value.into());
        self
    }

    /// Forces async-batch handling even when evaluation settles synchronously.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// A failure of this rule is surfaced immediately, bypassing the
    /// visibility debounce.
    pub fn skipping_debounce(mut self) -> Self {
        self.skips_debounce = true;
        self
    }

    pub(crate) fn forces_async(&self) -> bool {
        self.is_async || self.options.get("is_async").is_some_and(truthy)
    }

    pub(crate) fn input(&self, value: Value, all: BTreeMap<String, Value>) -> RuleInput {
        RuleInput {
            value,
            all,
            options: self.options.clone(),
        }
    }
}

/// Loose truthiness for dynamic values: null, `false`, zero, NaN and the
/// empty string are falsy; arrays and objects are always truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
