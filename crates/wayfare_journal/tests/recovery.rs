//! Crash-recovery tests for the journal.

use proptest::prelude::*;
use wayfare_journal::{FileBackend, InMemoryBackend, Journal, JournalBackend, JournalError};

fn write_batches(backend: &InMemoryBackend, batches: &[Vec<u32>]) {
    let mut journal: Journal<u32> = Journal::open(Box::new(backend.clone())).unwrap();
    for batch in batches {
        journal.append(batch).unwrap();
    }
}

proptest! {
    /// Cutting the journal at any byte yields a prefix of whole batches.
    #[test]
    fn any_truncation_replays_whole_batch_prefix(
        batches in prop::collection::vec(prop::collection::vec(any::<u32>(), 1..6), 1..8),
        cut_ratio in 0.0f64..1.0,
    ) {
        let backend = InMemoryBackend::new();
        write_batches(&backend, &batches);

        let bytes = backend.data();
        let cut = (bytes.len() as f64 * cut_ratio) as usize;
        let torn = InMemoryBackend::with_data(bytes[..cut].to_vec());

        let journal: Journal<u32> = Journal::open(Box::new(torn)).unwrap();
        let replayed = journal.replay().unwrap();

        let mut expected = Vec::new();
        let mut matched = replayed.is_empty();
        for batch in &batches {
            expected.extend(batch.iter().copied());
            if expected == replayed {
                matched = true;
            }
        }
        prop_assert!(matched, "replay {:?} is not a batch prefix", replayed);
    }
}

#[test]
fn file_journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.journal");

    {
        let mut journal: Journal<String> =
            Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        journal
            .append(&["create trip".to_string(), "create memory".to_string()])
            .unwrap();
    }

    let journal: Journal<String> =
        Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
    assert_eq!(
        journal.replay().unwrap(),
        vec!["create trip".to_string(), "create memory".to_string()]
    );
}

#[test]
fn corrupted_middle_frame_is_reported() {
    let backend = InMemoryBackend::new();
    write_batches(&backend, &[vec![1, 2], vec![3]]);

    let mut bytes = backend.data();
    bytes[14] ^= 0x55;
    let result: Result<Journal<u32>, _> = Journal::open(Box::new(InMemoryBackend::with_data(bytes)));
    assert!(matches!(result, Err(JournalError::Corrupted { .. })));
}

#[test]
fn compacted_file_journal_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.journal");
    let mut backend = FileBackend::open(&path).unwrap();
    backend.append(b"").unwrap();

    let mut journal: Journal<u32> = Journal::open(Box::new(backend)).unwrap();
    for i in 0..20 {
        journal.append(&[i]).unwrap();
    }
    journal.compact(&[19]).unwrap();
    journal.append(&[20]).unwrap();
    drop(journal);

    let journal: Journal<u32> =
        Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
    assert_eq!(journal.replay().unwrap(), vec![19, 20]);
}
