mod debounce;
mod field;
mod rule;
mod store;


pub use debounce::{DebounceTicket, Debouncer};
pub use field::{
    ChangeEvent, EventTarget, FieldConfig, FieldController, FieldError, FieldResult, Validity,
};
pub use rule::{
    BoxedRuleFuture, OptionMap, Rule, RuleEval, RuleInput, RuleOutcome, RuleRejection, RuleVerdict,
    truthy,
};
pub use store::FormStore;
