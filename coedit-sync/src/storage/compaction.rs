//! Folding a document's update log into one full-state entry.

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::{LogEntry, StoreError, UpdateLog};

/// Entry count at which a load triggers compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 50;

/// Load every entry of `doc_name`; compact first when there are at least
/// `threshold` of them.
///
/// Compaction replays the entries into a scratch replica and commits its
/// full state through [`UpdateLog::insert_and_delete_atomically`], so the
/// raw entries are only gone once the merged one is durable. If any entry
/// fails to decode the log is left untouched and returned as is.
pub async fn load_and_maybe_compact(
    log: &dyn UpdateLog,
    doc_name: &str,
    threshold: usize,
) -> Result<Vec<LogEntry>, StoreError> {
    let entries = log.list_ordered(doc_name).await?;
    if entries.len() < threshold.max(1) {
        return Ok(entries);
    }

    let merged = match replay(&entries) {
        Ok(merged) => merged,
        Err(e) => {
            log::warn!("Skipping compaction of '{doc_name}': {e}");
            return Ok(entries);
        }
    };

    let superseded: Vec<u64> = entries.iter().map(|e| e.id).collect();
    let entry = log
        .insert_and_delete_atomically(doc_name, merged, &superseded)
        .await?;
    log::info!(
        "Compacted {} log entries of '{doc_name}' into entry {}",
        superseded.len(),
        entry.id
    );
    Ok(vec![entry])
}

/// Replay entries into an empty replica and encode its full state.
pub fn replay(entries: &[LogEntry]) -> Result<Vec<u8>, StoreError> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for entry in entries {
            let update = Update::decode_v1(&entry.update)
                .map_err(|e| StoreError::Corrupt(format!("entry {}: {e}", entry.id)))?;
            txn.apply_update(update)
                .map_err(|e| StoreError::Corrupt(format!("entry {}: {e}", entry.id)))?;
        }
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RocksUpdateLog, StoreConfig};
    use tempfile::tempdir;
    use yrs::{GetString, Text};

    fn text_of(update: &[u8]) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
        }
        let txn = doc.transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    /// Append `n` single-character edits, returning the expected text.
    fn append_edits(log: &RocksUpdateLog, name: &str, n: usize) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        for i in 0..n {
            let sv = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let len = text.get_string(&txn).len() as u32;
                text.insert(&mut txn, len, &((b'a' + (i % 26) as u8) as char).to_string());
            }
            let delta = doc.transact().encode_state_as_update_v1(&sv);
            log.append_blocking(name, &delta).unwrap();
        }
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn test_below_threshold_untouched() {
        let dir = tempdir().unwrap();
        let log = RocksUpdateLog::open(StoreConfig::for_testing(dir.path())).unwrap();
        append_edits(&log, "doc", 10);

        let entries = load_and_maybe_compact(&log, "doc", 50).await.unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(log.list_blocking("doc").unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_sixty_entries_compact_to_one() {
        let dir = tempdir().unwrap();
        let log = RocksUpdateLog::open(StoreConfig::for_testing(dir.path())).unwrap();
        let expected = append_edits(&log, "doc", 60);
        let original = log.list_blocking("doc").unwrap();

        let entries = load_and_maybe_compact(&log, "doc", 50).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.list_blocking("doc").unwrap(), entries);

        assert_eq!(text_of(&entries[0].update), expected);
        assert_eq!(text_of(&replay(&original).unwrap()), expected);
    }

    #[tokio::test]
    async fn test_exact_threshold_compacts() {
        let dir = tempdir().unwrap();
        let log = RocksUpdateLog::open(StoreConfig::for_testing(dir.path())).unwrap();
        append_edits(&log, "doc", 50);

        let entries = load_and_maybe_compact(&log, "doc", 50).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_other_documents_untouched() {
        let dir = tempdir().unwrap();
        let log = RocksUpdateLog::open(StoreConfig::for_testing(dir.path())).unwrap();
        append_edits(&log, "a", 5);
        append_edits(&log, "b", 5);

        load_and_maybe_compact(&log, "a", 5).await.unwrap();
        assert_eq!(log.list_blocking("a").unwrap().len(), 1);
        assert_eq!(log.list_blocking("b").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_corrupt_entry_skips_compaction() {
        let dir = tempdir().unwrap();
        let log = RocksUpdateLog::open(StoreConfig::for_testing(dir.path())).unwrap();
        append_edits(&log, "doc", 3);
        log.append_blocking("doc", &[0xFF, 0xFF, 0xFF]).unwrap();

        let entries = load_and_maybe_compact(&log, "doc", 2).await.unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(log.list_blocking("doc").unwrap().len(), 4);
    }
}
