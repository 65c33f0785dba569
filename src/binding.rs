use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::controller::{FieldKey, FormController, FormResult, read_lock};
use crate::schema::{FieldLens, ValidationError};

pub type ChangeHandler<V> = Arc<dyn Fn(V) + Send + Sync>;
pub type BlurHandler = Arc<dyn Fn() + Send + Sync>;

/// Everything a visual input needs to render one field. Holds no validation
/// or timing logic; the handlers delegate to the controller.
#[derive(Clone)]
pub struct FieldBinding<V> {
    pub name: FieldKey,
    pub value: V,
    pub on_change: ChangeHandler<V>,
    pub on_blur: BlurHandler,
    pub aria_invalid: bool,
    /// Id of the element holding the field's error message, for
    /// `aria-describedby`.
    pub error_id: String,
    /// Display error, gated until the field is touched or a submit was
    /// attempted.
    pub error: Option<Cow<'static, str>>,
    pub required: bool,
    pub description: Option<Cow<'static, str>>,
}

impl<T, E> FormController<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: ValidationError,
{
    pub fn field_props<L>(&self, lens: L) -> FormResult<FieldBinding<L::Value>>
    where
        L: FieldLens<T>,
    {
        let value = self.value(lens)?;
        let change_controller = self.clone();
        let on_change: ChangeHandler<L::Value> =
            Arc::new(move |next| drop(change_controller.set(lens, next)));
        let blur_controller = self.clone();
        let on_blur: BlurHandler = Arc::new(move || drop(blur_controller.touch(lens)));
        self.finish_binding(lens.key(), value, on_change, on_blur)
    }

    /// Like [`field_props`](Self::field_props) but with raw↔typed transforms:
    /// `parse` turns raw input into the stored value (raw values it rejects
    /// are dropped), `format` renders the stored value for display.
    pub fn field_props_with<L, Raw>(
        &self,
        lens: L,
        parse: impl Fn(Raw) -> Option<L::Value> + Send + Sync + 'static,
        format: impl Fn(&L::Value) -> Raw + Send + Sync + 'static,
    ) -> FormResult<FieldBinding<Raw>>
    where
        L: FieldLens<T>,
        Raw: Clone + Send + Sync + 'static,
    {
        let value = format(&self.value(lens)?);
        let change_controller = self.clone();
        let on_change: ChangeHandler<Raw> = Arc::new(move |raw| {
            if let Some(parsed) = parse(raw) {
                drop(change_controller.set(lens, parsed));
            }
        });
        let blur_controller = self.clone();
        let on_blur: BlurHandler = Arc::new(move || drop(blur_controller.touch(lens)));
        self.finish_binding(lens.key(), value, on_change, on_blur)
    }

    pub fn decimal_field_props<L>(&self, lens: L) -> FormResult<FieldBinding<String>>
    where
        L: FieldLens<T, Value = Decimal>,
    {
        self.field_props_with(
            lens,
            |raw: String| Decimal::from_str(raw.trim()).ok(),
            |value| value.to_string(),
        )
    }

    pub fn field_error_for_display<L>(&self, lens: L) -> FormResult<Option<Cow<'static, str>>>
    where
        L: FieldLens<T>,
    {
        self.display_error_message(lens.key())
    }

    fn finish_binding<V>(
        &self,
        key: FieldKey,
        value: V,
        on_change: ChangeHandler<V>,
        on_blur: BlurHandler,
    ) -> FormResult<FieldBinding<V>> {
        let error = self.display_error_message(key)?;
        let required =
            read_lock(&self.required_fields, "reading required fields for binding")?.contains(&key);
        let description = read_lock(
            &self.field_descriptions,
            "reading field description for binding",
        )?
        .get(&key)
        .cloned();
        Ok(FieldBinding {
            name: key,
            value,
            on_change,
            on_blur,
            aria_invalid: error.is_some(),
            error_id: format!("form-{}-{}-error", self.form_id()?.0, key),
            error,
            required,
            description,
        })
    }

    fn display_error_message(&self, key: FieldKey) -> FormResult<Option<Cow<'static, str>>> {
        let state = read_lock(&self.state, "reading display error message")?;
        let Some(meta) = state.field_meta.get(&key) else {
            return Ok(None);
        };
        if !meta.touched && state.submit_count == 0 {
            return Ok(None);
        }
        Ok(meta.errors.first().map(ValidationError::message))
    }
}
