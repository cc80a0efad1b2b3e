//! Response extraction: recover one structured record from unreliable model output.
//!
//! [`extract_record`] runs the recovery ladder and returns the first object that parses;
//! [`extract_validated`] additionally applies a [`Schema`] so the caller always gets a
//! complete record. Neither function panics or returns anything but a tagged result.

mod ladder;
mod schema;

pub use ladder::{extract_record, ExtractionStep, Extracted};
pub use schema::{FieldKind, FieldSpec, Schema};

use crate::error::ExtractionFailure;

/// Run the ladder, then default and coerce the record against `schema`.
pub fn extract_validated(
    text: &str,
    truncated: bool,
    schema: &Schema,
) -> Result<Extracted, ExtractionFailure> {
    let extracted = extract_record(text, truncated)?;
    Ok(Extracted {
        record: schema.apply(extracted.record),
        step: extracted.step,
    })
}
