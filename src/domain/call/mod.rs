//! Call bounded context - dialog identity and call lifecycle

pub mod dialog;
pub mod value_object;

pub use dialog::{
    dialog_branch, new_call_id, new_tag, registration_branch, Dialog, DialogIds, SequenceCounter,
};
pub use value_object::{CallDirection, CallState, EndReason};
