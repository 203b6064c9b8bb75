use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use segmerge::bkd::{
    BkdConfig, BkdReader, BkdWriter, OneDimensionBkdWriter, PointRangeVisitor, VERSION_CURRENT,
    VERSION_PACKED_INDEX, VERSION_START,
};
use segmerge::storage::memory::{MemoryStorage, MemoryStorageConfig};
use segmerge::storage::structured::{StructReader, StructWriter};
use segmerge::storage::{IOContext, Storage};
use segmerge::util::numeric::int_to_sortable_bytes;

fn pack(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|&v| int_to_sortable_bytes(v)).collect()
}

fn open(storage: &MemoryStorage, name: &str, fp: u64) -> BkdReader {
    let input = storage.open_input(name, &IOContext::READ).unwrap();
    let mut input = StructReader::new(input, name);
    input.seek(fp).unwrap();
    BkdReader::open(input).unwrap()
}

fn query(reader: &BkdReader, lower: &[i32], upper: &[i32]) -> Vec<u32> {
    let mut visitor = PointRangeVisitor::new(pack(lower), pack(upper), 4).unwrap();
    reader.intersect(&mut visitor).unwrap();
    let mut docs = visitor.into_docs();
    docs.sort_unstable();
    docs
}

fn brute_force(points: &[(u32, Vec<i32>)], lower: &[i32], upper: &[i32]) -> Vec<u32> {
    let mut docs: Vec<u32> = points
        .iter()
        .filter(|(_, p)| (0..lower.len()).all(|d| lower[d] <= p[d] && p[d] <= upper[d]))
        .map(|(doc, _)| *doc)
        .collect();
    docs.sort_unstable();
    docs
}

#[test]
fn test_random_boxes_match_brute_force() {
    let storage = MemoryStorage::new(MemoryStorageConfig::default());
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let num_docs = 3000u32;
    let points: Vec<(u32, Vec<i32>)> = (0..num_docs)
        .map(|doc| (doc, vec![rng.random_range(-500..500), rng.random_range(-500..500)]))
        .collect();

    for version in [VERSION_START, VERSION_PACKED_INDEX, VERSION_CURRENT] {
        let name = format!("random_v{version}.dim");
        let config = BkdConfig::new(2, 2, 4, 64).unwrap();
        let mut writer = BkdWriter::new(config, num_docs).unwrap().with_version(version).unwrap();
        for (doc, p) in &points {
            writer.add(&pack(p), *doc).unwrap();
        }
        let output = storage.create_output(&name, &IOContext::DEFAULT).unwrap();
        let mut out = StructWriter::new(output);
        let fp = writer.finish(&mut out).unwrap().unwrap();
        out.close().unwrap();
        let reader = open(&storage, &name, fp);
        assert_eq!(reader.size(), num_docs as u64);
        assert_eq!(reader.doc_count(), num_docs);

        for _ in 0..50 {
            let (a, b) = (rng.random_range(-600..600), rng.random_range(-600..600));
            let (c, d) = (rng.random_range(-600..600), rng.random_range(-600..600));
            let lower = [a.min(b), c.min(d)];
            let upper = [a.max(b), c.max(d)];
            assert_eq!(
                query(&reader, &lower, &upper),
                brute_force(&points, &lower, &upper),
                "version={version} box={lower:?}..{upper:?}"
            );
        }

        // Degenerate boxes: a single point, an inverted range and everything.
        let (doc, p) = &points[17];
        assert!(query(&reader, p, p).contains(doc));
        assert!(query(&reader, &[10, 10], &[-10, -10]).is_empty());
        assert_eq!(
            query(&reader, &[i32::MIN, i32::MIN], &[i32::MAX, i32::MAX]).len(),
            num_docs as usize
        );
    }
}

#[test]
fn test_data_only_dimension_is_carried() {
    let storage = MemoryStorage::new(MemoryStorageConfig::default());
    let config = BkdConfig::new(3, 2, 4, 16).unwrap();
    let mut writer = BkdWriter::new(config, 200).unwrap();
    for doc in 0..200u32 {
        let x = doc as i32;
        writer.add(&pack(&[x, -x, x * 7]), doc).unwrap();
    }
    let output = storage.create_output("data.dim", &IOContext::DEFAULT).unwrap();
    let mut out = StructWriter::new(output);
    let fp = writer.finish(&mut out).unwrap().unwrap();
    out.close().unwrap();

    let reader = open(&storage, "data.dim", fp);
    assert_eq!(reader.num_data_dims(), 3);
    assert_eq!(reader.num_index_dims(), 2);
    assert_eq!(query(&reader, &[10, -20], &[30, -15]), (15..=20).collect::<Vec<u32>>());
}

#[test]
fn test_one_dimension_writer_with_duplicates() {
    let storage = MemoryStorage::new(MemoryStorageConfig::default());
    let mut values: Vec<i32> = (0..1000).map(|i| i / 3 - 100).collect();
    values.sort_unstable();

    let output = storage.create_output("one.dim", &IOContext::DEFAULT).unwrap();
    let mut out = StructWriter::new(output);
    let config = BkdConfig::new(1, 1, 4, 32).unwrap();
    let mut writer =
        OneDimensionBkdWriter::new(&mut out, config, values.len() as u32, VERSION_CURRENT).unwrap();
    for (doc, value) in values.iter().enumerate() {
        writer.add(&int_to_sortable_bytes(*value), doc as u32).unwrap();
    }
    let fp = writer.finish().unwrap().unwrap();
    out.close().unwrap();

    let reader = open(&storage, "one.dim", fp);
    let points: Vec<(u32, Vec<i32>)> = values
        .iter()
        .enumerate()
        .map(|(doc, v)| (doc as u32, vec![*v]))
        .collect();
    for (lower, upper) in [(-100, -100), (-5, 5), (200, 300), (0, 0), (233, 233)] {
        assert_eq!(
            query(&reader, &[lower], &[upper]),
            brute_force(&points, &[lower], &[upper]),
            "{lower}..={upper}"
        );
    }
}
