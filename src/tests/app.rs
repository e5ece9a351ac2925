use crate::app::{App, AppError, Attachment, IndexStatus};
use crate::bookmarks::{BookmarkCreate, BookmarkUpdate, SearchQuery};
use crate::config::Config;
use crate::semantic::embeddings::HASHING_MODEL;

/// Creates an App over a fresh temp directory, using the hashing embedder so
/// no model is downloaded.
fn create_app() -> (App, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let app = open_app(tmp.path(), |_| {});
    (app, tmp)
}

fn open_app(base_path: &std::path::Path, configure: impl FnOnce(&mut Config)) -> App {
    let mut config = Config::load_with(base_path).expect("failed to load config");
    config.semantic_search.model = HASHING_MODEL.to_string();
    configure(&mut config);
    config.save().expect("failed to save config");

    App::new(config, false).expect("failed to open app")
}

fn create(app: &App, title: &str, description: &str) -> u64 {
    let (bmark, status) = app
        .create(
            BookmarkCreate {
                title: Some(title.to_string()),
                description: Some(description.to_string()),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();
    assert_eq!(status, IndexStatus::Indexed);
    bmark.id
}

fn semantic_ids(app: &App, query: &str, limit: usize) -> Vec<u64> {
    app.semantic_search(query, Some(limit))
        .unwrap()
        .into_iter()
        .map(|m| m.bookmark.id)
        .collect()
}

#[test]
fn test_create_and_semantic_search() {
    let (app, _tmp) = create_app();

    let physics = create(&app, "quantum physics lecture notes", "");
    create(&app, "recipe for sourdough bread", "");
    let computing = create(&app, "introduction to quantum computing", "");

    let mut top = semantic_ids(&app, "quantum mechanics", 2);
    top.sort();
    assert_eq!(top, vec![physics, computing]);
}

#[test]
fn test_create_with_attachment() {
    let (app, tmp) = create_app();

    let (bmark, status) = app
        .create(
            BookmarkCreate {
                title: Some("Lab notes".to_string()),
                ..Default::default()
            },
            vec![Attachment {
                name: "photosynthesis.txt".to_string(),
                data: b"chlorophyll absorbs light in the thylakoid".to_vec(),
            }],
        )
        .unwrap();
    create(&app, "Garden planning", "raised beds");

    assert_eq!(status, IndexStatus::Indexed);
    assert_eq!(bmark.files.len(), 1);
    assert!(bmark.files[0].ends_with("_photosynthesis.txt"));
    assert!(tmp.path().join("uploads").join(&bmark.files[0]).exists());

    assert_eq!(semantic_ids(&app, "thylakoid chlorophyll", 1), vec![bmark.id]);
}

#[test]
fn test_bookmark_without_text_is_skipped() {
    let (app, _tmp) = create_app();

    let (_, status) = app
        .create(
            BookmarkCreate {
                url: Some("https://example.com".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();

    assert_eq!(status, IndexStatus::Skipped);
}

#[test]
fn test_edit_reindexes() {
    let (app, _tmp) = create_app();
    let id = create(&app, "volcano eruptions", "");
    create(&app, "glacier retreat", "");

    let (bmark, status) = app
        .update(
            id,
            BookmarkUpdate {
                title: Some("coral reefs".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();
    assert_eq!(bmark.title, "coral reefs");
    assert_eq!(status, IndexStatus::Indexed);
    assert_eq!(semantic_ids(&app, "coral reefs", 1), vec![id]);

    // tags are not embedded
    let (_, status) = app
        .update(
            id,
            BookmarkUpdate {
                tags: Some(vec!["ocean".to_string()]),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();
    assert_eq!(status, IndexStatus::Unchanged);
}

#[test]
fn test_detach_file() {
    let (app, tmp) = create_app();

    let (bmark, _) = app
        .create(
            BookmarkCreate {
                title: Some("Paper".to_string()),
                ..Default::default()
            },
            vec![Attachment {
                name: "notes.txt".to_string(),
                data: b"entanglement".to_vec(),
            }],
        )
        .unwrap();
    let ident = bmark.files[0].clone();

    let (bmark, status) = app
        .update(
            bmark.id,
            BookmarkUpdate {
                remove_files: vec!["notes.txt".to_string()],
                ..Default::default()
            },
            vec![],
        )
        .unwrap();

    assert!(bmark.files.is_empty());
    assert_eq!(status, IndexStatus::Indexed);
    assert!(!tmp.path().join("uploads").join(ident).exists());
}

#[test]
fn test_delete() {
    let (app, _tmp) = create_app();
    let id = create(&app, "short lived", "");
    let other = create(&app, "long lived", "");

    let deleted = app.delete(id).unwrap();
    assert_eq!(deleted.id, id);
    assert!(matches!(app.delete(id), Err(AppError::NotFound(_))));

    assert_eq!(semantic_ids(&app, "short lived", 5), vec![other]);
    assert!(app
        .search(SearchQuery {
            id: Some(id),
            ..Default::default()
        })
        .unwrap()
        .is_empty());
}

#[test]
fn test_view_counts() {
    let (app, _tmp) = create_app();
    let id = create(&app, "counted", "");

    app.view(id).unwrap();
    assert_eq!(app.view(id).unwrap().view_count, 2);
    assert!(matches!(app.view(999), Err(AppError::NotFound(999))));
}

#[test]
fn test_keyword_search() {
    let (app, _tmp) = create_app();
    create(&app, "Rust Programming Guide", "learn the language");
    create(&app, "Python Tutorial", "programming for beginners");

    let results = app
        .search(SearchQuery {
            keyword: Some("programming rust".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].title, "Rust Programming Guide");
}

#[test]
fn test_history() {
    let (app, _tmp) = create_app();
    create(&app, "quantum physics lecture notes", "");

    app.semantic_search("quantum", None).unwrap();
    app.semantic_search("sourdough", None).unwrap();

    let history = app.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].query, "sourdough");
    assert_eq!(history[1].query, "quantum");
    assert_eq!(history[1].results, 1);

    app.clear_history().unwrap();
    assert!(app.history().is_empty());
}

#[test]
fn test_disabled_semantic_search() {
    let tmp = tempfile::tempdir().unwrap();
    let app = open_app(tmp.path(), |config| config.semantic_search.enabled = false);

    let (_, status) = app
        .create(
            BookmarkCreate {
                title: Some("plain".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();

    assert_eq!(status, IndexStatus::Disabled);
    assert!(matches!(
        app.semantic_search("plain", None),
        Err(AppError::SemanticDisabled)
    ));
    assert!(app.stats().unwrap().index.is_none());
}

#[test]
fn test_missing_index_is_rebuilt_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let id = {
        let app = open_app(tmp.path(), |_| {});
        create(&app, "tide tables", "moon phases")
    };

    std::fs::remove_file(tmp.path().join("vector_map.json")).unwrap();

    let app = open_app(tmp.path(), |_| {});
    assert_eq!(semantic_ids(&app, "tide tables", 1), vec![id]);
    assert!(!app.stats().unwrap().index.unwrap().needs_rebuild);
}

#[test]
fn test_broken_index_without_rebuild_on_load() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let app = open_app(tmp.path(), |_| {});
        create(&app, "tide tables", "moon phases");
    }

    std::fs::remove_file(tmp.path().join("vectors.bin")).unwrap();

    let app = open_app(tmp.path(), |config| {
        config.semantic_search.rebuild_on_load = false
    });
    assert!(matches!(
        app.semantic_search("tide", None),
        Err(AppError::Semantic(_))
    ));

    assert_eq!(app.reindex(false).unwrap(), 1);
    assert_eq!(app.semantic_search("tide", None).unwrap().len(), 1);
}

#[test]
fn test_auto_tags_are_merged() {
    let tmp = tempfile::tempdir().unwrap();
    let app = open_app(tmp.path(), |config| {
        config.semantic_search.auto_tag.enabled = true;
        config.semantic_search.auto_tag.labels =
            vec!["machine learning".to_string(), "cooking".to_string()];
        config.semantic_search.auto_tag.threshold = 0.5;
    });

    let (bmark, status) = app
        .create(
            BookmarkCreate {
                title: Some("machine learning".to_string()),
                tags: Some(vec!["reading".to_string()]),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();

    assert_eq!(status, IndexStatus::Indexed);
    assert_eq!(bmark.tags, vec!["reading", "machine learning"]);
}

#[test]
fn test_changes_while_disabled_are_synced_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let (orchestration, bread) = {
        let app = open_app(tmp.path(), |_| {});
        (
            create(&app, "container orchestration", "scheduling pods"),
            create(&app, "sourdough bread", "starter and hydration"),
        )
    };

    let operators = {
        let app = open_app(tmp.path(), |config| config.semantic_search.enabled = false);
        app.delete(orchestration).unwrap();
        app.update(
            bread,
            BookmarkUpdate {
                title: Some("volcano eruptions".to_string()),
                description: Some("lava flows".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .unwrap();
        let (bmark, status) = app
            .create(
                BookmarkCreate {
                    title: Some("kubernetes operators".to_string()),
                    ..Default::default()
                },
                vec![],
            )
            .unwrap();
        assert_eq!(status, IndexStatus::Disabled);
        bmark.id
    };
    assert!(tmp.path().join("index-pending.json").exists());

    let app = open_app(tmp.path(), |config| config.semantic_search.enabled = true);
    assert_eq!(semantic_ids(&app, "kubernetes operators", 1), vec![operators]);
    assert_eq!(semantic_ids(&app, "volcano eruptions", 1), vec![bread]);
    assert!(!semantic_ids(&app, "container orchestration", 5).contains(&orchestration));
    assert_eq!(app.stats().unwrap().index.unwrap().live, 2);
    assert!(!tmp.path().join("index-pending.json").exists());
}

#[test]
fn test_unrecorded_delete_is_dropped_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let (gone, kept) = {
        let app = open_app(tmp.path(), |_| {});
        (
            create(&app, "container orchestration", ""),
            create(&app, "sourdough bread", ""),
        )
    };

    {
        let app = open_app(tmp.path(), |config| config.semantic_search.enabled = false);
        app.delete(gone).unwrap();
    }
    // the index still holds the deleted bookmark and nothing records it
    std::fs::remove_file(tmp.path().join("index-pending.json")).unwrap();

    let app = open_app(tmp.path(), |config| config.semantic_search.enabled = true);
    assert_eq!(app.stats().unwrap().index.unwrap().live, 1);
    assert_eq!(semantic_ids(&app, "container orchestration", 1), vec![kept]);
}

#[test]
fn test_index_status_serialization() {
    assert_eq!(
        serde_json::to_value(IndexStatus::Superseded).unwrap(),
        serde_json::json!({ "status": "superseded" })
    );
    assert_eq!(
        serde_json::to_value(IndexStatus::Unavailable("no model".to_string())).unwrap(),
        serde_json::json!({ "status": "unavailable", "reason": "no model" })
    );
}
