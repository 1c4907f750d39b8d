use std::fs;
use std::path::{Path, PathBuf};

fn collect_rs_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(read_dir) = fs::read_dir(&dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map(|e| e == "rs").unwrap_or(false) {
                    files.push(path);
                }
            }
        }
    }
    files
}

fn non_test_source(path: &Path) -> String {
    let content = fs::read_to_string(path).unwrap_or_default();
    // Unit tests are free to poke the cache directly.
    match content.find("#[cfg(test)]") {
        Some(idx) => content[..idx].to_string(),
        None => content,
    }
}

fn offenders(needles: &[&str], allowed: &[&str]) -> Vec<String> {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");

    let mut offenders = Vec::new();
    for file in collect_rs_files(&src_root) {
        let path_str = file.to_string_lossy().replace('\\', "/");
        if allowed.iter().any(|a| path_str.ends_with(a)) {
            continue;
        }
        let source = non_test_source(&file);
        if needles.iter().any(|needle| source.contains(needle)) {
            offenders.push(path_str);
        }
    }
    offenders
}

#[test]
fn feed_cache_writes_only_from_fanout_and_membership() {
    let allowed = [
        // cache: definitions
        "src/cache/mod.rs",
        "src/cache/feed_cache.rs",
        // publish-time delivery
        "src/fanout.rs",
        // follow backfill and unfollow purge
        "src/service.rs",
    ];

    let found = offenders(
        &["feeds.insert(", ".backfill(", ".remove_by_author("],
        &allowed,
    );
    assert!(
        found.is_empty(),
        "Feed cache writes must go through fan-out or follow membership. Offending files: {:?}",
        found
    );
}

#[test]
fn graph_edits_only_from_service() {
    let allowed = ["src/graph/social_graph.rs", "src/service.rs"];

    let found = offenders(&["graph.follow(", "graph.unfollow("], &allowed);
    assert!(
        found.is_empty(),
        "Follow edges must be edited through TimelineService so caches stay in step. Offending files: {:?}",
        found
    );
}
