use serde_json::Value;

/// Fold one layer onto the accumulated document. Nested tables merge key by
/// key; scalars and arrays from the later layer win outright.
pub(super) fn overlay_layer(base: &mut Value, layer: Value) {
    let Value::Object(entries) = layer else {
        *base = layer;
        return;
    };
    let Value::Object(table) = base else {
        *base = Value::Object(entries);
        return;
    };
    for (key, value) in entries {
        match table.get_mut(&key) {
            Some(slot) => overlay_layer(slot, value),
            None => {
                table.insert(key, value);
            }
        }
    }
}
