use std::fs;
use std::path::{Path, PathBuf};

use search_index::index::{DiskIndex, DiskIndexEngine, Index, IndexKind, IndexOptions, OpenMode};
use search_index::query::{MatchMode, QueryPlanner, SearchOptions, SearchRequest};
use search_index::SearchIndexError;
use tempfile::TempDir;

fn workspace() -> (TempDir, PathBuf) {
    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical tempdir");
    (temp, root)
}

fn open_names(root: &Path, options: IndexOptions) -> DiskIndex {
    Index::open_or_create(
        &DiskIndexEngine,
        root.join("index").join("names.idx"),
        IndexKind::NameIndexed,
        options,
    )
    .expect("open index")
}

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, b"x").expect("write");
}

#[test]
fn report_matches_only_with_trailing_fuzzy() {
    let (_temp, root) = workspace();
    let index = open_names(&root, IndexOptions::default());
    let report = root.join("docs").join("report.txt");
    touch(&report);
    assert!(index.add_document(&report, None).expect("add"));

    let exact = SearchRequest::new("report").with_mode(MatchMode::Exact);
    assert!(QueryPlanner::search(&index, &exact).is_empty());

    let fuzzy = SearchRequest::new("report").with_mode(MatchMode::TrailingFuzzy);
    assert_eq!(QueryPlanner::search(&index, &fuzzy), vec![report.clone()]);

    let leading = SearchRequest::new("txt").with_mode(MatchMode::LeadingFuzzy);
    assert_eq!(QueryPlanner::search(&index, &leading), vec![report]);
}

#[test]
fn stripped_extension_allows_exact_stem_match() {
    let (_temp, root) = workspace();
    let index = open_names(
        &root,
        IndexOptions {
            strip_extension: true,
        },
    );
    let report = root.join("report.txt");
    touch(&report);
    index.add_document(&report, None).expect("add");

    let exact = SearchRequest::new("report").with_mode(MatchMode::Exact);
    assert_eq!(index.search(&exact), vec![report]);
}

#[test]
fn adding_twice_yields_one_hit() {
    let (_temp, root) = workspace();
    let index = open_names(&root, IndexOptions::default());
    let file = root.join("zebra-migration.csv");
    touch(&file);

    index.add_document(&file, None).expect("add");
    index.add_document(&file, None).expect("add again");

    assert_eq!(index.search(&SearchRequest::new("zebra")), vec![file]);
}

#[test]
fn diacritics_are_searchable_both_ways() {
    let (_temp, root) = workspace();
    let index = open_names(&root, IndexOptions::default());
    let file = root.join("Résumé Ångström.pdf");
    touch(&file);
    index.add_document(&file, None).expect("add");

    assert_eq!(index.search(&SearchRequest::new("resume")), vec![file.clone()]);
    assert_eq!(index.search(&SearchRequest::new("résumé")), vec![file.clone()]);
    assert_eq!(index.search(&SearchRequest::new("angstrom")), vec![file]);
}

#[test]
fn decomposed_accents_fold_to_plain_letters() {
    let (_temp, root) = workspace();
    let index = open_names(&root, IndexOptions::default());
    let file = root.join("Re\u{301}sume\u{301}.pdf");
    touch(&file);
    index.add_document(&file, None).expect("add");

    assert_eq!(index.search(&SearchRequest::new("resume")), vec![file]);
}

#[test]
fn space_means_or_widens_results() {
    let (_temp, root) = workspace();
    let index = open_names(&root, IndexOptions::default());
    let apple = root.join("apple.txt");
    let pear = root.join("pear.txt");
    touch(&apple);
    touch(&pear);
    index.add_document(&apple, None).expect("add");
    index.add_document(&pear, None).expect("add");

    let both = SearchRequest::new("apple pear").with_mode(MatchMode::Exact);
    assert!(index.search(&both).is_empty());

    let either = SearchRequest::new("apple.txt pear.txt")
        .with_mode(MatchMode::Exact)
        .with_options(SearchOptions::SPACE_MEANS_OR);
    let mut found = index.search(&either);
    found.sort();
    assert_eq!(found, vec![apple, pear]);
}

#[test]
fn removal_semantics() {
    let (_temp, root) = workspace();
    let index = open_names(&root, IndexOptions::default());
    assert!(!index.remove_document(root.join("does-not-exist.txt")));

    let file = root.join("transient.log");
    touch(&file);
    index.add_document(&file, None).expect("add");
    fs::remove_file(&file).expect("delete");

    assert!(index.remove_document(&file));
    assert!(index.search(&SearchRequest::new("transient")).is_empty());
    assert!(!index.remove_document(&file));
}

#[test]
fn reopened_index_keeps_documents() {
    let (_temp, root) = workspace();
    let file = root.join("ledger.ods");
    touch(&file);
    {
        let index = open_names(&root, IndexOptions::default());
        index.add_document(&file, Some("accounts")).expect("add");
    }

    let reader = Index::open(
        &DiskIndexEngine,
        root.join("index").join("names.idx"),
        OpenMode::ReadOnly,
        IndexOptions::default(),
    )
    .expect("reopen");
    assert_eq!(reader.kind(), IndexKind::NameIndexed);
    assert_eq!(reader.search(&SearchRequest::new("accounts")), vec![file]);
}

#[test]
fn writer_registry_is_per_canonical_path() {
    let (_temp, root) = workspace();
    let _writer = open_names(&root, IndexOptions::default());

    // Same file reached through a `..` detour.
    let detour = root.join("index").join("..").join("index").join("names.idx");
    let second: Result<DiskIndex, _> = Index::open_or_create(
        &DiskIndexEngine,
        detour,
        IndexKind::NameIndexed,
        IndexOptions::default(),
    );
    assert!(matches!(second, Err(SearchIndexError::OpenConflict(_))));
}

#[test]
fn content_index_finds_words_inside_files() {
    let (_temp, root) = workspace();
    let index: DiskIndex = Index::open_or_create(
        &DiskIndexEngine,
        root.join("content.idx"),
        IndexKind::ContentIndexed,
        IndexOptions::default(),
    )
    .expect("open");

    let notes = root.join("notes").join("standup.md");
    fs::create_dir_all(notes.parent().expect("parent")).expect("mkdir");
    fs::write(&notes, "Deploy the kangaroo service on Friday").expect("write");
    let other = root.join("notes").join("other.md");
    fs::write(&other, "Nothing to see").expect("write");

    let outcomes = index
        .add_documents_in(root.join("notes"), None)
        .expect("add dir");
    assert_eq!(outcomes.len(), 2);

    assert_eq!(index.search(&SearchRequest::new("kangaroo")), vec![notes]);
    assert!(index.search(&SearchRequest::new("standup")).is_empty());
}
