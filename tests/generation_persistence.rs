use std::fs;
use std::io::Write;

use tiervec::{IndexConfig, TierIndex, VectorError};

const DIM: usize = 4;

fn seed_vectors(n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            let f = i as f32;
            vec![f, (f * 0.5).sin() * 10.0, (i % 9) as f32, -f * 0.25]
        })
        .collect()
}

fn built(dir: &std::path::Path, n: usize) -> TierIndex {
    let config = IndexConfig {
        max_cluster_size: 16,
        min_cluster_size: 2,
        target_clusters: 8,
        search_fanout: 8,
        ..IndexConfig::default()
    };
    let index = TierIndex::create(dir, config).unwrap();
    index.build(&seed_vectors(n), None, DIM, false).unwrap();
    index
}

fn top_vids(index: &TierIndex, query: &[f32], k: usize) -> Vec<i64> {
    index
        .search(query, k)
        .unwrap()
        .iter()
        .map(|s| s.vid)
        .collect()
}

#[test]
fn save_then_load_preserves_ranking_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let query = [7.0, 3.0, 4.0, -2.0];
    let (generation, before) = {
        let index = built(dir.path(), 60);
        index.delete(11).unwrap();
        let generation = index.save().unwrap();
        (generation, top_vids(&index, &query, 10))
    };
    assert_eq!(generation, "gen-000002", "save publishes after the build");

    let reloaded = TierIndex::load(dir.path()).unwrap();
    assert!(reloaded.is_ready());
    assert_eq!(reloaded.sample_count(), 60);
    assert_eq!(reloaded.deleted_count(), 1);
    assert_eq!(reloaded.dim(), DIM);
    assert_eq!(top_vids(&reloaded, &query, 10), before);
    assert!(top_vids(&reloaded, &query, 60).iter().all(|&v| v != 11));
}

#[test]
fn unsaved_appends_and_deletes_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = built(dir.path(), 30);
        index
            .add(&[vec![100.0, 0.0, 0.0, 0.0]], None)
            .unwrap();
        index.delete(3).unwrap();
        // no explicit save: the build's generation was mutated in place
    }
    let reloaded = TierIndex::load(dir.path()).unwrap();
    assert_eq!(reloaded.sample_count(), 31);
    assert_eq!(reloaded.deleted_count(), 1);
    let hit = reloaded.search(&[100.0, 0.0, 0.0, 0.0], 1).unwrap();
    assert_eq!(hit.slots()[0].vid, 30);
    assert!(top_vids(&reloaded, &[3.0, 9.97, 3.0, -0.75], 30)
        .iter()
        .all(|&v| v != 3));
}

#[test]
fn load_without_published_generation_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        TierIndex::load(dir.path()),
        Err(VectorError::Config(_))
    ));
}

#[test]
fn corrupt_head_artifact_refuses_to_load() {
    let dir = tempfile::tempdir().unwrap();
    {
        built(dir.path(), 40).save().unwrap();
    }
    let current = fs::read_to_string(dir.path().join("CURRENT")).unwrap();
    let head_path = dir.path().join(current.trim()).join("head.bin");
    let mut bytes = fs::read(&head_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x40;
    fs::write(&head_path, &bytes).unwrap();
    assert!(matches!(
        TierIndex::load(dir.path()),
        Err(VectorError::Corruption(_))
    ));
}

#[test]
fn torn_posting_tail_only_degrades_recall() {
    let dir = tempfile::tempdir().unwrap();
    {
        built(dir.path(), 40);
    }
    // simulate a crash mid-append on one posting log
    let current = fs::read_to_string(dir.path().join("CURRENT")).unwrap();
    let postings_dir = dir.path().join(current.trim()).join("postings");
    let log = fs::read_dir(&postings_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "log"))
        .unwrap();
    let mut file = fs::OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&[0x11; 7]).unwrap();
    drop(file);

    let reloaded = TierIndex::load(dir.path()).unwrap();
    let result = reloaded.search(&[5.0, 5.0, 5.0, -1.0], 20).unwrap();
    assert!(result.result_count() > 0, "intact frames still serve");
}

#[test]
fn successive_saves_stack_generations() {
    let dir = tempfile::tempdir().unwrap();
    let index = built(dir.path(), 20);
    let first = index.save().unwrap();
    index.add(&seed_vectors(5), None).unwrap();
    let second = index.save().unwrap();
    assert_ne!(first, second);
    assert_eq!(
        fs::read_to_string(dir.path().join("CURRENT")).unwrap().trim(),
        second
    );
    // the older generation is still a complete snapshot on disk
    assert!(dir.path().join(&first).join("manifest.json").exists());
    assert!(dir.path().join(&first).join("head.bin").exists());

    let reloaded = TierIndex::load(dir.path()).unwrap();
    assert_eq!(reloaded.sample_count(), 25);
}

#[test]
fn deletes_racing_saves_are_never_lost() {
    let dir = tempfile::tempdir().unwrap();
    let index = built(dir.path(), 60);
    let vectors = seed_vectors(60);

    // a delete acknowledged while a snapshot is being published must
    // survive both the in-memory swap and the reload
    for vid in 0..40i64 {
        let acknowledged = std::thread::scope(|scope| {
            let saver = {
                let index = index.clone();
                scope.spawn(move || index.save().unwrap())
            };
            let deleter = {
                let index = index.clone();
                scope.spawn(move || index.delete(vid).unwrap())
            };
            saver.join().unwrap();
            deleter.join().unwrap()
        });
        assert!(acknowledged);
        assert!(top_vids(&index, &vectors[vid as usize], 60)
            .iter()
            .all(|&v| v != vid));
    }
    assert_eq!(index.deleted_count(), 40);

    let reloaded = TierIndex::load(dir.path()).unwrap();
    assert_eq!(reloaded.deleted_count(), 40);
    for vid in 0..40i64 {
        assert!(top_vids(&reloaded, &vectors[vid as usize], 60)
            .iter()
            .all(|&v| v != vid));
    }
}
