//! Dev session behaviour across failing and recovering rebuilds.

use kiln_core::dev::{ChangeEvent, ChangeKind, LiveUpdate};
use kiln_core::{BuildConfig, Bundler, DevSession, EntryPoint, SessionState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;

fn write(root: &std::path::Path, path: &str, content: &str) -> PathBuf {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(&full, content).unwrap();
    full
}

#[tokio::test]
async fn test_transform_failure_keeps_serving_last_good_snapshot() {
    let dir = tempdir().unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    write(&root, "src/index.js", "require('./theme.scss');\n");
    let theme = write(&root, "src/theme.scss", "$c: red;\nbody { color: $c; }\n");

    let mut config = BuildConfig::new(&root);
    config.entries = vec![EntryPoint {
        name: "app".into(),
        import: "./src/index.js".into(),
    }];
    config.shared_styles.clear();

    let session = Arc::new(DevSession::new(Bundler::new(config).unwrap()));
    let initial = session.start().unwrap();
    let mut updates = session.subscribe();

    let (tx, rx) = mpsc::unbounded_channel();
    let loop_handle = tokio::spawn(Arc::clone(&session).run(rx, Duration::from_millis(20)));

    // Break the stylesheet
    write(&root, "src/theme.scss", "body { color: $undefined; }\n");
    tx.send(vec![ChangeEvent::new(theme.clone(), ChangeKind::Modified)])
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(10), updates.recv())
        .await
        .unwrap()
        .unwrap();
    let LiveUpdate::Error { code, message } = msg else {
        panic!("expected an error message, got {msg:?}");
    };
    assert_eq!(code, "TRANSFORM_ERROR");
    assert!(message.contains("theme.scss"), "{message}");
    assert_eq!(session.state(), SessionState::Serving);
    assert_eq!(session.snapshot().unwrap().hash, initial.snapshot.hash);
    assert_eq!(session.status().last_error.unwrap().code, "TRANSFORM_ERROR");

    // Fix it
    write(&root, "src/theme.scss", "body { color: blue; }\n");
    tx.send(vec![ChangeEvent::new(theme, ChangeKind::Modified)])
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(10), updates.recv())
        .await
        .unwrap()
        .unwrap();
    let LiveUpdate::Update { styles, .. } = msg else {
        panic!("expected a style update, got {msg:?}");
    };
    assert_eq!(styles.len(), 1);
    assert!(session.last_error().is_none());
    assert_ne!(session.snapshot().unwrap().hash, initial.snapshot.hash);

    drop(tx);
    loop_handle.await.unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
}
