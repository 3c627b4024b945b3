use annal::frame::{FRAME_HEADER_LEN, KIND_CHECK, KIND_DATA, MAX_RECORD_SIZE};
use annal::segment::segment_path;
use annal::{AppendJournal, JournalReader};
use tempfile::tempdir;

/// Five maximum-size records: the first segment takes its link frame plus
/// three of them, the fourth no longer fits and forces a rotation, and the
/// new segment opens with a link frame of its own.
#[tokio::test(flavor = "multi_thread")]
async fn full_segment_rotates_with_a_link_frame() {
    let dir = tempdir().expect("tempdir");
    let journal = AppendJournal::open(dir.path()).expect("journal open");

    let payload = vec![0xAB; MAX_RECORD_SIZE - FRAME_HEADER_LEN];
    for _ in 0..5 {
        journal.append(&payload).await.expect("append");
    }
    journal.close().await.expect("close");

    assert!(segment_path(dir.path(), 0).exists());
    assert!(segment_path(dir.path(), 1).exists());
    assert!(!segment_path(dir.path(), 2).exists());

    let mut reader = JournalReader::open(dir.path()).expect("reader open");
    let mut kinds = Vec::new();
    while let Some(record) = reader.next_record().await.expect("record") {
        if record.kind == KIND_DATA {
            assert_eq!(record.payload, payload);
        }
        kinds.push(record.kind);
    }
    assert_eq!(
        kinds,
        vec![
            KIND_CHECK,
            KIND_DATA,
            KIND_DATA,
            KIND_DATA,
            KIND_CHECK,
            KIND_DATA,
            KIND_DATA
        ]
    );
}
