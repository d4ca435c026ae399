//! End-to-end tests over a real database directory: lifecycle, append,
//! iteration, range queries, and the master/read-only split.

use serde_json::json;
use tempfile::TempDir;
use timeranger::{
    Database, DbConfig, Direction, MatchCond, RecordKey, TopicConfig, TrError, MARKER_FILE,
};

const DAY1: u64 = 1_704_067_200; // 2024-01-01 00:00:00 UTC
const DAY2: u64 = DAY1 + 86_400;

fn master(tmp: &TempDir) -> Database {
    Database::startup(DbConfig::new(tmp.path(), "testdb")).unwrap()
}

/// Collects matching rowids with a forward find loop.
fn scan(db: &mut Database, topic: &str, key: &RecordKey, cond: &MatchCond) -> Vec<i64> {
    let mut hits = Vec::new();
    let mut start = None;
    while let Some((rowid, _)) = db.find(topic, key, cond, Direction::Forward, start).unwrap() {
        hits.push(rowid);
        start = Some(rowid + 1);
    }
    hits
}

#[test]
fn startup_creates_marker_and_acquires_master() {
    let tmp = TempDir::new().unwrap();
    let db = master(&tmp);
    assert!(db.is_master());
    assert!(tmp.path().join("testdb").join(MARKER_FILE).is_file());
    db.shutdown();
}

#[test]
fn second_master_is_silently_downgraded() {
    let tmp = TempDir::new().unwrap();
    let db1 = master(&tmp);
    let db2 = Database::startup(DbConfig::new(tmp.path(), "testdb")).unwrap();
    assert!(db1.is_master());
    assert!(!db2.is_master());

    // Releasing the first handle frees the role for a later open.
    db2.shutdown();
    db1.shutdown();
    let db3 = master(&tmp);
    assert!(db3.is_master());
}

#[test]
fn non_master_requires_existing_database() {
    let tmp = TempDir::new().unwrap();
    let res = Database::startup(DbConfig::new(tmp.path(), "testdb").with_master(false));
    assert!(matches!(res, Err(TrError::NotFound(_))));
}

#[test]
fn create_topic_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    let cfg = TopicConfig::new("events", "id").with_tkey("when");
    db.create_topic(&cfg).unwrap();
    let desc_path = tmp
        .path()
        .join("testdb")
        .join("events")
        .join("topic_desc.json");
    let before = std::fs::read(&desc_path).unwrap();
    db.create_topic(&cfg).unwrap();
    assert_eq!(std::fs::read(&desc_path).unwrap(), before);
}

#[test]
fn append_then_scan_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();

    for i in 0..5u64 {
        let (key, rowid, meta) = db
            .append("events", DAY1 + i, 0, &json!({"id": "s1", "v": i}))
            .unwrap();
        assert_eq!(key, RecordKey::Str("s1".into()));
        assert_eq!(rowid, i as i64);
        assert_eq!(meta.t, DAY1 + i);
    }

    let key = RecordKey::Str("s1".into());
    let (rowid, meta) = db.first("events", &key).unwrap().unwrap();
    assert_eq!((rowid, meta.t), (0, DAY1));
    let mut seen = vec![meta.t];
    let mut pos = rowid;
    while let Some((rowid, meta)) = db.next("events", &key, pos).unwrap() {
        seen.push(meta.t);
        pos = rowid;
    }
    assert_eq!(seen, (0..5).map(|i| DAY1 + i).collect::<Vec<_>>());

    let (rowid, meta) = db.last("events", &key).unwrap().unwrap();
    assert_eq!((rowid, meta.t), (4, DAY1 + 4));
}

#[test]
fn offsets_are_contiguous() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    for i in 0..4u64 {
        db.append("events", DAY1, 0, &json!({"id": "s1", "payload": i}))
            .unwrap();
    }

    let key = RecordKey::Str("s1".into());
    let mut expected_offset = 0u64;
    for rowid in 0..4 {
        let (meta, record) = db.read_record("events", &key, rowid).unwrap();
        assert_eq!(meta.offset, expected_offset);
        assert_eq!(record.unwrap()["payload"], json!(rowid));
        expected_offset += u64::from(meta.size);
    }
}

#[test]
fn time_range_query() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    for i in 0..10u64 {
        db.append("events", DAY1 + i, 0, &json!({"id": "s1", "v": i}))
            .unwrap();
    }
    let key = RecordKey::Str("s1".into());

    let cond = MatchCond::compile(&json!({
        "from_t": DAY1 + 3,
        "to_t": DAY1 + 7,
    }))
    .unwrap();
    assert_eq!(scan(&mut db, "events", &key, &cond), vec![3, 4, 5, 6, 7]);

    // Negative to_rowid counts back from the last record.
    let cond = MatchCond::compile(&json!({"to_rowid": -2})).unwrap();
    assert_eq!(
        scan(&mut db, "events", &key, &cond),
        (0..=7).collect::<Vec<i64>>()
    );

    // Backward find lands on the upper edge of the window.
    let cond = MatchCond::compile(&json!({"to_t": DAY1 + 5})).unwrap();
    let (rowid, meta) = db
        .find("events", &key, &cond, Direction::Backward, None)
        .unwrap()
        .unwrap();
    assert_eq!((rowid, meta.t), (5, DAY1 + 5));
}

#[test]
fn buckets_split_by_day() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    db.append("events", DAY1, 0, &json!({"id": "s1", "v": 1}))
        .unwrap();
    db.append("events", DAY2, 0, &json!({"id": "s1", "v": 2}))
        .unwrap();

    let key_dir = tmp.path().join("testdb").join("events").join("s1");
    for name in [
        "2024-01-01.json",
        "2024-01-01.md2",
        "2024-01-02.json",
        "2024-01-02.md2",
    ] {
        assert!(key_dir.join(name).is_file(), "missing {}", name);
    }

    // The sequence index spans both buckets seamlessly.
    let key = RecordKey::Str("s1".into());
    let (_, record) = db.read_record("events", &key, 1).unwrap();
    assert_eq!(record.unwrap()["v"], json!(2));
}

#[test]
fn range_cache_tracks_appends() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    for i in 0..6u64 {
        db.append("events", DAY1 + i * 10, 0, &json!({"id": "s1", "v": i}))
            .unwrap();
    }

    let key = RecordKey::Str("s1".into());
    let range = db.topic("events").unwrap().key_range(&key).unwrap();
    assert_eq!(range.rows, 6);
    assert_eq!(range.fr_t, DAY1);
    assert_eq!(range.to_t, DAY1 + 50);

    // A fresh handle rebuilds the same view by scanning the files.
    let mut db2 =
        Database::startup(DbConfig::new(tmp.path(), "testdb").with_master(false)).unwrap();
    db2.open_topic("events").unwrap();
    let range2 = db2.topic("events").unwrap().key_range(&key).unwrap();
    assert_eq!(range2.rows, 6);
    assert_eq!((range2.fr_t, range2.to_t), (DAY1, DAY1 + 50));
}

#[test]
fn non_master_reads_but_cannot_write() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    db.append("events", DAY1, 7, &json!({"id": "s1", "v": 1}))
        .unwrap();

    let mut ro = Database::startup(DbConfig::new(tmp.path(), "testdb").with_master(false)).unwrap();
    let key = RecordKey::Str("s1".into());
    let (meta, record) = ro.read_record("events", &key, 0).unwrap();
    assert_eq!(meta.user_flag, 7);
    assert_eq!(record.unwrap()["v"], json!(1));

    let err = ro
        .append("events", DAY1, 0, &json!({"id": "s2", "v": 2}))
        .unwrap_err();
    assert!(matches!(err, TrError::NotMaster(_)));
    assert!(!tmp.path().join("testdb").join("events").join("s2").exists());
    assert!(matches!(
        ro.soft_delete("events", &key, 0),
        Err(TrError::NotMaster(_))
    ));
}

#[test]
fn delete_and_user_flag_visibility() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    for i in 0..4u64 {
        db.append("events", DAY1 + i, 0, &json!({"id": "s1", "v": i}))
            .unwrap();
    }
    let key = RecordKey::Str("s1".into());

    db.soft_delete("events", &key, 1).unwrap();
    db.hard_delete("events", &key, 2).unwrap();

    let all = MatchCond::compile(&json!({})).unwrap();
    assert_eq!(scan(&mut db, "events", &key, &all), vec![0, 3]);

    // Soft-deleted records come back with the opt-in; hard-deleted never.
    let with_deleted = MatchCond::compile(&json!({"deleted": true})).unwrap();
    assert_eq!(scan(&mut db, "events", &key, &with_deleted), vec![0, 1, 3]);

    db.write_user_flag("events", &key, 0, 0b100).unwrap();
    assert_eq!(db.set_user_flag("events", &key, 0, 0b001).unwrap(), 0b101);
    assert_eq!(db.read_user_flag("events", &key, 0).unwrap(), 0b101);

    let flagged = MatchCond::compile(&json!({"user_flag_mask_set": 0b100})).unwrap();
    assert_eq!(scan(&mut db, "events", &key, &flagged), vec![0]);
}

#[test]
fn int_key_topic_partitions_by_number() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("meters", "")).unwrap();

    let err = db
        .append("meters", DAY1, 0, &json!({"": 0, "v": 1}))
        .unwrap_err();
    assert!(matches!(err, TrError::Parameter(_)));

    let (key, rowid, _) = db
        .append("meters", DAY1, 0, &json!({"": 42, "v": 1}))
        .unwrap();
    assert_eq!(key, RecordKey::Int(42));
    assert_eq!(rowid, 0);
    assert!(tmp.path().join("testdb").join("meters").join("42").is_dir());
}

#[test]
fn tkey_drives_tm_and_tm_queries() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id").with_tkey("when"))
        .unwrap();

    for (i, when) in ["2024-01-01 00:00:10", "2024-01-01 00:00:20"]
        .iter()
        .enumerate()
    {
        db.append(
            "events",
            DAY1 + i as u64,
            0,
            &json!({"id": "s1", "when": when}),
        )
        .unwrap();
    }

    let key = RecordKey::Str("s1".into());
    let cond = MatchCond::compile(&json!({"from_tm": DAY1 + 15})).unwrap();
    assert_eq!(scan(&mut db, "events", &key, &cond), vec![1]);
}

#[test]
fn delete_topic_removes_tree() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    db.append("events", DAY1, 0, &json!({"id": "s1", "v": 1}))
        .unwrap();

    db.delete_topic("events").unwrap();
    assert!(!tmp.path().join("testdb").join("events").exists());
    assert!(matches!(
        db.open_topic("events"),
        Err(TrError::NotFound(_))
    ));
}

#[test]
fn backup_topic_moves_data_aside() {
    let tmp = TempDir::new().unwrap();
    let mut db = master(&tmp);
    db.create_topic(&TopicConfig::new("events", "id")).unwrap();
    db.append("events", DAY1, 0, &json!({"id": "s1", "v": 1}))
        .unwrap();

    db.backup_topic("events", None, None, false, None).unwrap();

    let bak = tmp.path().join("testdb").join("events.bak");
    assert!(bak.join("s1").join("2024-01-01.md2").is_file());

    // The recreated topic is empty and writable.
    let (_, rowid, _) = db
        .append("events", DAY1, 0, &json!({"id": "s1", "v": 2}))
        .unwrap();
    assert_eq!(rowid, 0);
}

#[test]
fn reopen_survives_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let mut db = master(&tmp);
        db.create_topic(&TopicConfig::new("events", "id")).unwrap();
        for i in 0..3u64 {
            db.append("events", DAY1 + i, 0, &json!({"id": "s1", "v": i}))
                .unwrap();
        }
        db.shutdown();
    }

    let mut db = master(&tmp);
    let key = RecordKey::Str("s1".into());
    let (rowid, meta) = db.last("events", &key).unwrap().unwrap();
    assert_eq!((rowid, meta.t), (2, DAY1 + 2));

    // Appends continue the existing sequence.
    let (_, rowid, _) = db
        .append("events", DAY1 + 3, 0, &json!({"id": "s1", "v": 3}))
        .unwrap();
    assert_eq!(rowid, 3);
}
