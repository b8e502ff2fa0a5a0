//! Parsing helpers for Redis Stream replies.
//!
//! Entry format on the wire: `[message_id, [field1, value1, field2, ...]]`.

use std::collections::HashMap;

/// Parse one stream entry into `(message_id, fields)`.
pub(crate) fn parse_entry(entry: &redis::Value) -> Option<(String, HashMap<String, String>)> {
    let redis::Value::Bulk(parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }

    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return None,
    };

    let redis::Value::Bulk(raw_fields) = &parts[1] else {
        return None;
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    Some((id, fields))
}
