use xxhash_rust::xxh3::Xxh3;

use logdeck_types::LogEntry;

/// Stable document id for an entry.
///
/// Hashes timestamp, logger, thread, message and trace id, so re-sending the
/// same entry addresses the same document and `op_type=create` turns it into
/// a conflict instead of a copy.
pub fn document_id(entry: &LogEntry) -> String {
    let mut hasher = Xxh3::new();
    for field in [
        entry.timestamp.as_deref(),
        entry.logger.as_deref(),
        entry.thread.as_deref(),
        Some(entry.message.as_str()),
        entry.trace_id.as_deref(),
    ] {
        match field {
            Some(value) => hasher.update(value.as_bytes()),
            None => hasher.update(&[0x00]),
        }
        hasher.update(&[0x1f]);
    }
    format!("{:032x}", hasher.digest128())
}
