use std::sync::Arc;
use std::thread;

use segmerge::index::field_infos::FieldNumbers;
use segmerge::storage::memory::{MemoryStorage, MemoryStorageConfig};
use segmerge::{
    BufferedUpdatesStream, Codec, Document, FrozenBufferedUpdates, MergeConfig, MergeExecutor,
    ReaderPool, Segmerge10Codec, SegmentCommitInfo, SegmentWriter, Storage, Term,
};

fn new_pool() -> Arc<ReaderPool> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
    let codec: Arc<dyn Codec> = Arc::new(Segmerge10Codec::new());
    Arc::new(ReaderPool::new(storage, codec))
}

/// Flush `docs` docs tagged with `group` = doc % 2 and publish the segment.
fn publish(
    pool: &ReaderPool,
    stream: &BufferedUpdatesStream,
    numbers: &Arc<FieldNumbers>,
    name: &str,
    docs: u32,
) -> SegmentCommitInfo {
    let mut writer = SegmentWriter::new(name, Arc::clone(numbers), &MergeConfig::default());
    for i in 0..docs {
        writer
            .add_document(
                Document::new()
                    .add_keyword("id", format!("{name}-{i}"))
                    .add_keyword("group", (i % 2).to_string()),
            )
            .unwrap();
    }
    let mut info = writer
        .flush(pool.storage().as_ref(), pool.codec().as_ref())
        .unwrap();
    info.buffered_deletes_gen = stream.next_gen();
    pool.add(&info).unwrap();
    stream.finished_segment(info.buffered_deletes_gen);
    info
}

#[test]
fn test_packets_only_touch_older_segments() {
    let pool = new_pool();
    let stream = Arc::new(BufferedUpdatesStream::new());
    let numbers = FieldNumbers::new();
    let mut resolver = stream.start_resolver(Arc::clone(&pool)).unwrap();

    publish(&pool, &stream, &numbers, "_0", 4);
    publish(&pool, &stream, &numbers, "_1", 4);
    let packet = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("group", "0")], None));
    let del_gen = stream.push(Arc::clone(&packet));
    publish(&pool, &stream, &numbers, "_2", 4);

    resolver.resolve(Arc::clone(&packet)).unwrap();
    packet.wait_applied();
    resolver.shutdown().unwrap();

    assert_eq!(pool.num_docs("_0").unwrap(), 2);
    assert_eq!(pool.num_docs("_1").unwrap(), 2);
    assert_eq!(pool.num_docs("_2").unwrap(), 4);
    assert!(!stream.any());
    assert!(stream.completed_del_gen() >= del_gen);
    assert!(!stream.still_running(del_gen));

    assert_eq!(pool.write_all_live_docs().unwrap(), 2);
    let persisted = pool.segment_infos();
    assert_eq!(persisted[0].del_count, 2);
    assert_eq!(persisted[0].del_gen, 1);
    assert_eq!(persisted[2].del_count, 0);
}

#[test]
fn test_concurrent_packets_all_apply() {
    let pool = new_pool();
    let stream = Arc::new(BufferedUpdatesStream::new());
    let numbers = FieldNumbers::new();
    publish(&pool, &stream, &numbers, "_0", 16);
    publish(&pool, &stream, &numbers, "_1", 16);

    let packets: Vec<Arc<FrozenBufferedUpdates>> = (0..8)
        .map(|i| {
            let packet = Arc::new(FrozenBufferedUpdates::new(
                vec![Term::new("id", format!("_0-{i}")), Term::new("id", format!("_1-{i}"))],
                None,
            ));
            stream.push(Arc::clone(&packet));
            packet
        })
        .collect();

    let handles: Vec<_> = packets
        .iter()
        .cloned()
        .map(|packet| {
            let pool = Arc::clone(&pool);
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                // Either this thread or a helper applies it.
                if !packet.try_apply(&stream, &pool).unwrap() {
                    packet.wait_applied();
                }
            })
        })
        .collect();
    stream.wait_apply_all(&pool).unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(packets.iter().all(|p| p.is_applied()));
    assert_eq!(stream.pending_updates_count(), 0);
    assert_eq!(stream.ram_bytes_used(), 0);
    assert_eq!(pool.num_docs("_0").unwrap(), 8);
    assert_eq!(pool.num_docs("_1").unwrap(), 8);
    let last = packets.iter().map(|p| p.del_gen()).max().unwrap();
    assert_eq!(stream.completed_del_gen(), last);
}

#[test]
fn test_private_packet_targets_one_segment() {
    let pool = new_pool();
    let stream = Arc::new(BufferedUpdatesStream::new());
    let numbers = FieldNumbers::new();
    publish(&pool, &stream, &numbers, "_0", 4);
    publish(&pool, &stream, &numbers, "_1", 4);

    let packet = Arc::new(FrozenBufferedUpdates::new(
        vec![Term::new("group", "1")],
        Some("_1".to_string()),
    ));
    stream.push(Arc::clone(&packet));
    packet.force_apply(&stream, &pool).unwrap();

    assert_eq!(pool.num_docs("_0").unwrap(), 4);
    assert_eq!(pool.num_docs("_1").unwrap(), 2);
}

#[test]
fn test_merge_waits_for_pending_deletes() {
    let pool = new_pool();
    let stream = Arc::new(BufferedUpdatesStream::new());
    let numbers = FieldNumbers::new();
    publish(&pool, &stream, &numbers, "_0", 6);
    publish(&pool, &stream, &numbers, "_1", 6);
    let packet = Arc::new(FrozenBufferedUpdates::new(vec![Term::new("group", "0")], None));
    stream.push(Arc::clone(&packet));
    // Published after the packet, so untouched by it and newer than it.
    publish(&pool, &stream, &numbers, "_2", 6);

    let executor = MergeExecutor::new(
        Arc::clone(&pool),
        Arc::clone(&stream),
        Arc::clone(&numbers),
        MergeConfig::default(),
    )
    .unwrap();
    let sources: Vec<String> = ["_0", "_1", "_2"].iter().map(|s| s.to_string()).collect();
    let merged = executor.merge(&sources, "_3").unwrap().unwrap();

    assert!(packet.is_applied());
    assert_eq!(merged.max_doc(), 3 + 3 + 6);
    assert_eq!(pool.len(), 1);
    let reader = pool.get_reader("_3").unwrap();
    let group0 = reader.postings("group", b"0").unwrap().unwrap();
    // Only the docs of _2 remain in group 0, after the six survivors of _0 and _1.
    assert_eq!(group0.iter().map(|p| p.doc).collect::<Vec<_>>(), vec![6, 8, 10]);
}
