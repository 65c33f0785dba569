use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::controller::FieldKey;

/// Reserved key for cross-field and engine-level errors not attributable to a
/// single field.
pub const FORM_KEY: FieldKey = FieldKey::new("form");

pub trait ValidationError: Clone + Send + Sync + 'static {
    fn message(&self) -> Cow<'static, str>;

    /// Stand-in error used when the rule engine itself panics.
    fn engine_failure() -> Self;
}

impl ValidationError for String {
    fn message(&self) -> Cow<'static, str> {
        Cow::Owned(self.clone())
    }

    fn engine_failure() -> Self {
        "validation failed unexpectedly".to_string()
    }
}

impl ValidationError for &'static str {
    fn message(&self) -> Cow<'static, str> {
        Cow::Borrowed(self)
    }

    fn engine_failure() -> Self {
        "validation failed unexpectedly"
    }
}

pub trait FieldLens<T>: Copy + Send + Sync + 'static {
    type Value: Clone + PartialEq + Send + Sync + 'static;

    fn key(self) -> FieldKey;
    fn get<'a>(self, model: &'a T) -> &'a Self::Value;
    fn set(self, model: &mut T, value: Self::Value);
}

pub trait FormModel: Clone + Send + Sync + 'static {
    type Fields;

    fn fields() -> Self::Fields;

    fn field_keys() -> &'static [FieldKey] {
        &[]
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldValidation<E> {
    pub is_valid: bool,
    pub error: Option<E>,
}

/// Outcome of a whole-form validation pass: every violation, grouped by
/// field key. Keys for nested data are dot-joined paths.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport<E> {
    violations: BTreeMap<FieldKey, Vec<E>>,
}

impl<E> ValidationReport<E>
where
    E: ValidationError,
{
    pub fn valid() -> Self {
        Self {
            violations: BTreeMap::new(),
        }
    }

    pub fn from_violations(violations: BTreeMap<FieldKey, Vec<E>>) -> Self {
        Self {
            violations: violations
                .into_iter()
                .filter(|(_, errors)| !errors.is_empty())
                .collect(),
        }
    }

    pub fn engine_failure() -> Self {
        Self {
            violations: BTreeMap::from([(FORM_KEY, vec![E::engine_failure()])]),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &BTreeMap<FieldKey, Vec<E>> {
        &self.violations
    }

    pub fn into_violations(self) -> BTreeMap<FieldKey, Vec<E>> {
        self.violations
    }

    /// First message per field, for simple display.
    pub fn field_errors(&self) -> BTreeMap<FieldKey, E> {
        self.violations
            .iter()
            .filter_map(|(key, errors)| errors.first().map(|error| (*key, error.clone())))
            .collect()
    }

    pub fn errors_for(&self, key: FieldKey) -> Vec<E> {
        self.violations.get(&key).cloned().unwrap_or_default()
    }

    pub fn first_error_field(&self) -> Option<FieldKey> {
        self.violations.keys().next().copied()
    }
}

/// The contract a declarative schema must satisfy. The engine never inspects
/// rule internals; it only runs whole-object validation and reads the report.
pub trait Schema<T>: Send + Sync {
    type Error: ValidationError;

    fn validate(&self, candidate: &T) -> ValidationReport<Self::Error>;

    /// Keys the schema declares rules for.
    fn field_keys(&self) -> BTreeSet<FieldKey>;
}

/// Runs whole-object validation. A panic inside the schema is downgraded to a
/// single generic error under [`FORM_KEY`] instead of crashing the form.
pub fn evaluate<T, S>(schema: &S, candidate: &T) -> ValidationReport<S::Error>
where
    S: Schema<T> + ?Sized,
{
    match catch_unwind(AssertUnwindSafe(|| schema.validate(candidate))) {
        Ok(report) => report,
        Err(_) => ValidationReport::engine_failure(),
    }
}

/// Validates a single field by substituting `value` into a clone of `rest`
/// and running the whole-object rules, so cross-field rules see current
/// sibling values. Errors attributed to other fields do not make this field
/// invalid.
pub fn evaluate_field<T, S, L>(
    schema: &S,
    lens: L,
    value: L::Value,
    rest: &T,
) -> FieldValidation<S::Error>
where
    T: Clone,
    S: Schema<T> + ?Sized,
    L: FieldLens<T>,
{
    let mut candidate = rest.clone();
    lens.set(&mut candidate, value);
    field_outcome(&evaluate(schema, &candidate), lens.key())
}

pub(crate) fn field_outcome<E>(report: &ValidationReport<E>, key: FieldKey) -> FieldValidation<E>
where
    E: ValidationError,
{
    let error = report
        .violations
        .get(&key)
        .and_then(|errors| errors.first())
        .cloned();
    FieldValidation {
        is_valid: error.is_none(),
        error,
    }
}

pub trait FieldValidator<T, L, E>: Send + Sync
where
    L: FieldLens<T>,
    E: ValidationError,
{
    fn validate(&self, model: &T, value: &L::Value) -> Result<(), E>;
}

impl<T, L, E, F> FieldValidator<T, L, E> for F
where
    L: FieldLens<T>,
    E: ValidationError,
    F: for<'a> Fn(&'a T, &'a L::Value) -> Result<(), E> + Send + Sync,
{
    fn validate(&self, model: &T, value: &L::Value) -> Result<(), E> {
        (self)(model, value)
    }
}

pub trait FormValidator<T, E>: Send + Sync
where
    E: ValidationError,
{
    fn validate(&self, model: &T) -> Vec<(FieldKey, E)>;
}

impl<T, E, F> FormValidator<T, E> for F
where
    E: ValidationError,
    F: Fn(&T) -> Vec<(FieldKey, E)> + Send + Sync,
{
    fn validate(&self, model: &T) -> Vec<(FieldKey, E)> {
        (self)(model)
    }
}

type FieldRuleFn<T, E> = Arc<dyn Fn(&T) -> Result<(), E> + Send + Sync>;
type FormRuleFn<T, E> = Arc<dyn Fn(&T) -> Vec<(FieldKey, E)> + Send + Sync>;

/// Bundled [`Schema`] implementation: declarative per-field rules plus
/// cross-field form rules.
pub struct RuleSet<T, E> {
    field_rules: BTreeMap<FieldKey, Vec<FieldRuleFn<T, E>>>,
    form_rules: Vec<FormRuleFn<T, E>>,
    first_error_only: bool,
}

impl<T, E> RuleSet<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: ValidationError,
{
    pub fn new() -> Self {
        Self {
            field_rules: BTreeMap::new(),
            form_rules: Vec::new(),
            first_error_only: false,
        }
    }

    /// Stop evaluating a field's remaining rules after its first violation.
    pub fn first_error_only(mut self, value: bool) -> Self {
        self.first_error_only = value;
        self
    }

    pub fn rule<L, V>(mut self, lens: L, validator: V) -> Self
    where
        L: FieldLens<T>,
        V: FieldValidator<T, L, E> + 'static,
    {
        let validator = Arc::new(validator);
        let wrapped: FieldRuleFn<T, E> =
            Arc::new(move |model: &T| validator.validate(model, lens.get(model)));
        self.field_rules.entry(lens.key()).or_default().push(wrapped);
        self
    }

    pub fn form_rule<V>(mut self, validator: V) -> Self
    where
        V: FormValidator<T, E> + 'static,
    {
        let validator = Arc::new(validator);
        let wrapped: FormRuleFn<T, E> = Arc::new(move |model: &T| validator.validate(model));
        self.form_rules.push(wrapped);
        self
    }
}

impl<T, E> Default for RuleSet<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: ValidationError,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Schema<T> for RuleSet<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: ValidationError,
{
    type Error = E;

    fn validate(&self, candidate: &T) -> ValidationReport<E> {
        let mut violations = BTreeMap::<FieldKey, Vec<E>>::new();

        for (key, rules) in &self.field_rules {
            let mut errors = Vec::new();
            for rule in rules {
                if let Err(error) = rule(candidate) {
                    errors.push(error);
                    if self.first_error_only {
                        break;
                    }
                }
            }
            if !errors.is_empty() {
                violations.insert(*key, errors);
            }
        }

        for rule in &self.form_rules {
            for (key, error) in rule(candidate) {
                violations.entry(key).or_default().push(error);
            }
        }

        ValidationReport::from_violations(violations)
    }

    fn field_keys(&self) -> BTreeSet<FieldKey> {
        self.field_rules.keys().copied().collect()
    }
}
