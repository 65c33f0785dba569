mod binding;
mod controller;
mod debounce;
mod draft;
mod schema;


pub use formwork_derive::FormModel;

pub use binding::{BlurHandler, ChangeHandler, FieldBinding};
pub use controller::{
    FieldKey, FieldMeta, FormController, FormError, FormId, FormOptions, FormResult, FormSnapshot,
    SubmitState,
};
pub use debounce::{DebounceTicket, Debouncer};
pub use draft::{FormDraftStore, InMemoryDraftStore};
pub use schema::{
    FORM_KEY, FieldLens, FieldValidation, FieldValidator, FormModel, FormValidator, RuleSet,
    Schema, ValidationError, ValidationReport, evaluate, evaluate_field,
};
