use crate::partial::PartialRecord;
use crate::sites::ShapeRules;

/// True iff a required field of the shape is still absent.
pub fn needs_fallback(record: &PartialRecord, rules: &ShapeRules) -> bool {
    rules.required.iter().any(|f| record.get(*f).is_absent())
}

/// Field-by-field merge; the rendered pass only fills fields the static pass left absent.
pub fn merge(static_pass: PartialRecord, rendered: PartialRecord) -> PartialRecord {
    let mut merged = static_pass;
    for (field, slot) in rendered.into_fields() {
        if merged.get(field).is_absent() {
            merged.set(field, slot);
        }
    }
    merged
}
