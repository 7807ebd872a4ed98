use std::collections::VecDeque;

use super::models::Field;
use super::{Result, TelemetryError};

/// Default bound on retained raw lines
pub const HISTORY_LIMIT: usize = 1000;

/// Highest field index a key may be assigned to
pub const MAX_FIELD_INDEX: usize = 1023;

/// Split a line on `,` and carry the key at each position over from the
/// previous field list. Positions past the previous length start unnamed.
pub fn remap_fields(previous: &[Field], line: &str) -> Vec<Field> {
    line.split(',')
        .enumerate()
        .map(|(i, token)| Field {
            key: previous.get(i).and_then(|f| f.key.clone()),
            value: token.trim().to_string(),
        })
        .collect()
}

/// Name the field at `index`, growing the list with placeholders if needed
pub fn set_field_key(fields: &mut Vec<Field>, index: usize, key: Option<String>) -> Result<()> {
    if index > MAX_FIELD_INDEX {
        return Err(TelemetryError::InvalidConfiguration(format!(
            "field index {} exceeds maximum {}",
            index, MAX_FIELD_INDEX
        )));
    }
    if index >= fields.len() {
        fields.resize(index + 1, Field::placeholder());
    }
    fields[index].key = key.filter(|k| !k.is_empty());
    Ok(())
}

/// Append a line and evict the oldest entries beyond `limit`
pub fn push_history(history: &mut VecDeque<String>, line: &str, limit: usize) {
    history.push_back(line.to_string());
    while history.len() > limit {
        history.pop_front();
    }
}
