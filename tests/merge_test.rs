use std::sync::Arc;

use segmerge::bkd::PointRangeVisitor;
use segmerge::index::field_infos::FieldNumbers;
use segmerge::index::sort::SortFieldType;
use segmerge::storage::memory::{MemoryStorage, MemoryStorageConfig};
use segmerge::storage::{IOContext, MergeInfo};
use segmerge::util::numeric::int_to_sortable_bytes;
use segmerge::{
    BufferedUpdatesStream, Codec, Document, IndexSort, MergeConfig, MergeExecutor, MergeState,
    ReaderPool, Segmerge10Codec, SegmentCommitInfo, SegmentInfo, SegmentMerger, SegmentReader,
    SegmentWriter, SortField, Storage, StoredValue,
};

struct TestIndex {
    pool: Arc<ReaderPool>,
    stream: Arc<BufferedUpdatesStream>,
    numbers: Arc<FieldNumbers>,
    config: MergeConfig,
}

impl TestIndex {
    fn new(config: MergeConfig) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        let codec: Arc<dyn Codec> = Arc::new(Segmerge10Codec::from_config(&config));
        TestIndex {
            pool: Arc::new(ReaderPool::new(storage, codec)),
            stream: Arc::new(BufferedUpdatesStream::new()),
            numbers: FieldNumbers::new(),
            config,
        }
    }

    fn flush(&self, name: &str, docs: Vec<Document>) -> SegmentCommitInfo {
        let mut writer = SegmentWriter::new(name, Arc::clone(&self.numbers), &self.config);
        for doc in docs {
            writer.add_document(doc).unwrap();
        }
        let mut info = writer
            .flush(self.pool.storage().as_ref(), self.pool.codec().as_ref())
            .unwrap();
        info.buffered_deletes_gen = self.stream.next_gen();
        self.pool.add(&info).unwrap();
        self.stream.finished_segment(info.buffered_deletes_gen);
        info
    }

    fn executor(&self) -> MergeExecutor {
        MergeExecutor::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.stream),
            Arc::clone(&self.numbers),
            self.config.clone(),
        )
        .unwrap()
    }
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn doc(id: u32) -> Document {
    Document::new()
        .add_keyword("id", id.to_string())
        .add_text("body", format!("common token{id}"))
        .add_numeric_doc_value("n", id as i64 * 10)
}

#[test]
fn test_merge_two_segments_concatenates() {
    let index = TestIndex::new(MergeConfig::default());
    index.flush("_0", (0..5).map(doc).collect());
    index.flush("_1", (5..10).map(doc).collect());

    let merged = index
        .executor()
        .merge(&names(&["_0", "_1"]), "_2")
        .unwrap()
        .unwrap();
    assert_eq!(merged.max_doc(), 10);

    let reader = index.pool.get_reader("_2").unwrap();
    // Doc 3 of the second segment.
    assert_eq!(reader.document(8).unwrap().get("id").and_then(StoredValue::as_str), Some("8"));
    let postings = reader.postings("body", b"token8").unwrap().unwrap();
    assert_eq!(postings.iter().map(|p| p.doc).collect::<Vec<_>>(), vec![8]);
    assert_eq!(postings[0].positions, vec![1]);
    assert_eq!(reader.doc_values().unwrap().numeric("n").unwrap().get(8), Some(80));
}

#[test]
fn test_merge_renumbers_around_deletes() {
    let index = TestIndex::new(MergeConfig::default());
    index.flush("_0", (0..5).map(doc).collect());
    index.flush("_1", (5..10).map(doc).collect());
    assert!(index.pool.delete_document("_0", 2).unwrap());

    let merged = index
        .executor()
        .merge(&names(&["_0", "_1"]), "_2")
        .unwrap()
        .unwrap();
    assert_eq!(merged.max_doc(), 9);
    assert_eq!(merged.del_count, 0);

    let reader = index.pool.get_reader("_2").unwrap();
    // Old doc 3 of _1 follows the four live docs of _0.
    let stored = reader.document(7).unwrap();
    assert_eq!(stored.get("id").and_then(StoredValue::as_str), Some("8"));
    let postings = reader.postings("id", b"8").unwrap().unwrap();
    assert_eq!(postings.iter().map(|p| p.doc).collect::<Vec<_>>(), vec![7]);
    assert!(reader.postings("id", b"2").unwrap().is_none());
    let n = reader.doc_values().unwrap().numeric("n").unwrap();
    assert_eq!(n.get(7), Some(80));
    assert_eq!(n.get(2), Some(30));

    let common = reader.postings("body", b"common").unwrap().unwrap();
    assert_eq!(common.len(), 9);
    assert!(common.windows(2).all(|w| w[0].doc < w[1].doc));
}

#[test]
fn test_merge_single_segment_compacts_deletes() {
    let index = TestIndex::new(MergeConfig::default());
    index.flush("_0", (0..10).map(doc).collect());
    for deleted in [0, 3, 4, 9] {
        index.pool.delete_document("_0", deleted).unwrap();
    }
    let merged = index.executor().merge(&names(&["_0"]), "_1").unwrap().unwrap();
    assert_eq!(merged.max_doc(), 6);

    let reader = index.pool.get_reader("_1").unwrap();
    let ids: Vec<String> = (0..6)
        .map(|d| {
            reader.document(d).unwrap().get("id").and_then(StoredValue::as_str).unwrap().to_string()
        })
        .collect();
    assert_eq!(ids, vec!["1", "2", "5", "6", "7", "8"]);
}

#[test]
fn test_sorted_merge_interleaves_segments() {
    let sort = IndexSort::new(vec![SortField::new("rank", SortFieldType::Long)]);
    let index = TestIndex::new(MergeConfig::default().with_index_sort(sort.clone()));
    let ranked = |rank: i64| {
        Document::new()
            .add_stored("rank", rank)
            .add_numeric_doc_value("rank", rank)
    };
    let first = index.flush("_0", vec![ranked(30), ranked(10), ranked(50)]);
    assert_eq!(first.info.index_sort.as_ref(), Some(&sort));
    index.flush("_1", vec![ranked(40), ranked(20)]);

    let merged = index
        .executor()
        .merge(&names(&["_0", "_1"]), "_2")
        .unwrap()
        .unwrap();
    assert_eq!(merged.info.index_sort.as_ref(), Some(&sort));

    let reader = index.pool.get_reader("_2").unwrap();
    let stored: Vec<i64> = (0..5)
        .map(|d| reader.document(d).unwrap().get("rank").and_then(StoredValue::as_long).unwrap())
        .collect();
    assert_eq!(stored, vec![10, 20, 30, 40, 50]);
    let values = reader.doc_values().unwrap().numeric("rank").unwrap();
    assert_eq!((0..5).map(|d| values.get(d).unwrap()).collect::<Vec<_>>(), stored);
}

#[test]
fn test_merged_points_follow_doc_map() {
    // Small leaves so the merged tree has several levels.
    let index = TestIndex::new(MergeConfig::default().with_max_points_in_leaf_node(8));
    let point = |x: i32| Document::new().add_int_point("p", &[x]).add_stored("x", x as i64);
    index.flush("_0", (0..40).map(point).collect());
    index.flush("_1", (40..80).map(point).collect());
    index.pool.delete_document("_0", 10).unwrap();

    index.executor().merge(&names(&["_0", "_1"]), "_2").unwrap().unwrap();
    let reader = index.pool.get_reader("_2").unwrap();
    let tree = reader.points().unwrap().tree("p").unwrap();
    let mut visitor = PointRangeVisitor::new(
        int_to_sortable_bytes(5).to_vec(),
        int_to_sortable_bytes(45).to_vec(),
        4,
    )
    .unwrap();
    tree.intersect(&mut visitor).unwrap();
    let mut docs = visitor.into_docs();
    docs.sort_unstable();
    // 5..=45 minus the deleted 10, each doc shifted down by one past it.
    let expected: Vec<u32> = (5..10).chain(10..45).collect();
    assert_eq!(docs, expected);
    for doc in docs {
        let x = reader.document(doc).unwrap().get("x").and_then(StoredValue::as_long).unwrap();
        assert!((5..=45).contains(&x) && x != 10);
    }
}

/// Merges `_0` and `_1` into `_2` without committing, returning the source
/// snapshot and the merge result.
fn merge_uncommitted(index: &TestIndex) -> (Vec<SegmentReader>, MergeState, SegmentInfo) {
    let sources = names(&["_0", "_1"]);
    index.pool.start_merge(&sources).unwrap();
    let readers = index.pool.merge_readers(&sources).unwrap();
    let storage = Arc::clone(index.pool.storage());
    let codec = Arc::clone(index.pool.codec());
    let total_max_doc = readers.iter().map(|r| r.max_doc()).sum();
    let merger = SegmentMerger::new(
        &readers,
        SegmentInfo::new("_2", 0, codec.name()),
        storage.as_ref(),
        codec.as_ref(),
        Arc::clone(&index.numbers),
        IOContext::merge(MergeInfo {
            total_max_doc,
            estimated_merge_bytes: 0,
            is_external: false,
            merge_max_num_segments: -1,
        }),
        &MergeConfig::default(),
    )
    .unwrap();
    let state = merger.merge().unwrap();
    let mut info = state.segment_info.clone();
    info.write(storage.as_ref(), &IOContext::DEFAULT).unwrap();
    (readers, state, info)
}

#[test]
fn test_deletes_during_merge_are_carried() {
    let index = TestIndex::new(MergeConfig::default());
    index.flush("_0", (0..4).map(doc).collect());
    index.flush("_1", (4..8).map(doc).collect());
    let (readers, state, info) = merge_uncommitted(&index);

    // Lands after the snapshot.
    assert!(index.pool.delete_document("_1", 1).unwrap());

    let merged = index
        .pool
        .commit_merge(&readers, &state, SegmentCommitInfo::new(info))
        .unwrap()
        .unwrap();
    assert_eq!(merged.max_doc(), 8);
    assert_eq!(index.pool.num_docs("_2").unwrap(), 7);
    let reader = index.pool.get_reader("_2").unwrap();
    assert!(!reader.is_live(5));
    assert!(reader.is_live(4));
}

#[test]
fn test_unreadable_merged_segment_keeps_sources() {
    let index = TestIndex::new(MergeConfig::default());
    index.flush("_0", (0..4).map(doc).collect());
    index.flush("_1", (4..8).map(doc).collect());
    let (readers, state, info) = merge_uncommitted(&index);
    index.pool.storage().delete_file("_2.fdt").unwrap();

    assert!(
        index
            .pool
            .commit_merge(&readers, &state, SegmentCommitInfo::new(info))
            .is_err()
    );
    assert_eq!(index.pool.len(), 2);
    assert!(index.pool.contains("_0"));
    assert!(index.pool.contains("_1"));
    assert!(!index.pool.contains("_2"));

    let sources = names(&["_0", "_1"]);
    index.pool.abort_merge(&sources);
    index.pool.start_merge(&sources).unwrap();
    assert_eq!(index.pool.num_docs("_1").unwrap(), 4);
}
