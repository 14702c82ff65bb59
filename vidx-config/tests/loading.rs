use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::tempdir;
use vidx_config::{
    CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigError, ConfigSource, Pipeline, VidxConfig,
};
use vidx_core::{ItemStatus, KeyframeReconciliation, MemoryCatalog, PoolSizes};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn env_guard() -> MutexGuard<'static, ()> {
    let guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    unsafe {
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var(CONFIG_JSON_ENV);
    }
    guard
}

const SAMPLE: &str = r#"
[library]
root = "/srv/videos"
video_extensions = ["mp4", "mkv"]

[storyboard]
cols = 4
rows = 3
reconciliation = "truncate"

[tools]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"
timeout_secs = 90

[workers]
batch = 2
"#;

#[test]
fn toml_file_overrides_only_named_fields() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(&path, SAMPLE).unwrap();

    let config = VidxConfig::load_from_file(&path).unwrap();
    assert_eq!(config.library.root.as_deref(), Some(Path::new("/srv/videos")));
    assert_eq!(config.library.video_extensions, ["mp4", "mkv"]);
    assert_eq!(config.storyboard.cols, 4);
    assert_eq!(config.storyboard.rows, 3);
    assert_eq!(config.storyboard.cell_width, 160);
    assert_eq!(config.storyboard.reconciliation, KeyframeReconciliation::Truncate);
    assert_eq!(config.tools.ffprobe, Path::new("ffprobe"));
    assert_eq!(config.tools.timeout().map(|t| t.as_secs()), Some(90));

    let options = config.storyboard_options();
    assert_eq!(options.layout.per_page(), 12);
    assert_eq!(options.jpeg_quality, 75);
}

#[test]
fn env_path_takes_precedence() {
    let _guard = env_guard();
    let dir = tempdir().unwrap();
    let path = dir.path().join("elsewhere.toml");
    fs::write(&path, SAMPLE).unwrap();
    fs::write(dir.path().join("vidx.toml"), "[workers]\nbatch = 9\n").unwrap();
    unsafe {
        std::env::set_var(CONFIG_PATH_ENV, &path);
        std::env::set_var(CONFIG_JSON_ENV, r#"{"workers": {"batch": 5}}"#);
    }

    let (config, source) = VidxConfig::load_from_env_in(dir.path()).unwrap();
    unsafe {
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var(CONFIG_JSON_ENV);
    }
    assert_eq!(source, ConfigSource::EnvPath(path));
    assert_eq!(config.workers.batch, 2);
}

#[test]
fn inline_json_beats_default_files() {
    let _guard = env_guard();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("vidx.toml"), "[workers]\nbatch = 9\n").unwrap();
    unsafe { std::env::set_var(CONFIG_JSON_ENV, r#"{"workers": {"batch": 5}}"#) };

    let (config, source) = VidxConfig::load_from_env_in(dir.path()).unwrap();
    unsafe { std::env::remove_var(CONFIG_JSON_ENV) };
    assert_eq!(source, ConfigSource::EnvInline);
    assert_eq!(config.workers.batch, 5);
}

#[test]
fn default_file_then_defaults() {
    let _guard = env_guard();
    let dir = tempdir().unwrap();

    let (config, source) = VidxConfig::load_from_env_in(dir.path()).unwrap();
    assert_eq!(source, ConfigSource::Default);
    assert_eq!(config, VidxConfig::default());

    let file = dir.path().join("vidx.toml");
    fs::write(&file, "[workers]\nbatch = 9\n").unwrap();
    let (config, source) = VidxConfig::load_from_env_in(dir.path()).unwrap();
    assert_eq!(source, ConfigSource::File(file));
    assert_eq!(config.workers.batch, 9);
}

#[test]
fn invalid_values_are_rejected_on_load() {
    let _guard = env_guard();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("vidx.toml"), "[storyboard]\njpeg_quality = 0\n").unwrap();

    let err = VidxConfig::load_from_env_in(dir.path()).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::JpegQuality(0))
    );
}

#[test]
fn validation_catches_degenerate_settings() {
    let mut config = VidxConfig::default();
    assert_eq!(config.validate(), Ok(()));

    config.storyboard.cols = 0;
    assert_eq!(config.validate(), Err(ConfigError::EmptyTileLayout));
    config.storyboard.cols = 5;

    config.assets.preview_seconds = 0.0;
    assert_eq!(config.validate(), Err(ConfigError::PreviewLength(0.0)));
    config.assets.preview_seconds = 4.0;

    config.assets.thumbnail_width = 0;
    assert_eq!(config.validate(), Err(ConfigError::ZeroWidth("thumbnail")));
    config.assets.thumbnail_width = 320;

    config.library.video_extensions.clear();
    assert_eq!(config.validate(), Err(ConfigError::NoVideoExtensions));
}

#[test]
fn oversized_storyboard_sheets_are_rejected() {
    let mut config = VidxConfig::default();
    config.storyboard.cols = 70_000;
    config.storyboard.cell_width = 70_000;
    assert_eq!(
        config.validate(),
        Err(ConfigError::SheetTooLarge {
            cols: 70_000,
            rows: 5,
            cell_width: 70_000,
            cell_height: 90,
        })
    );

    // Fits in u32 but not in a JPEG.
    config.storyboard.cols = 500;
    config.storyboard.cell_width = 160;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::SheetTooLarge { .. })
    ));

    config.storyboard.cols = 400;
    assert_eq!(config.validate(), Ok(()));
}

#[test]
fn zero_workers_fall_back_to_cpu_sizes() {
    let mut config = VidxConfig::default();
    config.workers.metadata = 3;
    let derived = PoolSizes::default();
    let sizes = config.pool_sizes();
    assert_eq!(sizes.metadata, 3);
    assert_eq!(sizes.hashing, derived.hashing);
    assert_eq!(sizes.batch, derived.batch);
}

#[test]
fn pipeline_scans_the_configured_library() {
    let dir = tempdir().unwrap();
    let library = dir.path().join("library");
    fs::create_dir_all(library.join("Shows/S01")).unwrap();
    fs::write(library.join("Shows/S01/e01.mkv"), vec![7u8; 2048]).unwrap();
    fs::write(library.join("Shows/S01/e01-copy.mkv"), vec![7u8; 2048]).unwrap();
    fs::write(library.join("Shows/cover.jpg"), b"jpg").unwrap();

    let mut config = VidxConfig::default();
    config.assets.root = dir.path().join("assets");
    let unconfigured =
        Pipeline::from_config(config.clone(), Arc::new(MemoryCatalog::new())).unwrap();
    assert!(unconfigured.library_files().is_err());

    config.library.root = Some(library);
    let pipeline = Pipeline::from_config(config, Arc::new(MemoryCatalog::new())).unwrap();
    assert_eq!(pipeline.library_files().unwrap().len(), 2);

    let duplicates = pipeline.find_duplicates().unwrap();
    assert_eq!(duplicates.groups.len(), 1);
    assert_eq!(duplicates.duplicate_files(), 2);
}

#[test]
fn pipeline_survives_cancelling_one_batch() {
    let dir = tempdir().unwrap();
    let mut config = VidxConfig::default();
    config.assets.root = dir.path().join("assets");
    let pipeline = Pipeline::from_config(config, Arc::new(MemoryCatalog::new())).unwrap();

    let labels = |n: usize| (0..n).map(|i| format!("job-{i}")).collect::<Vec<_>>();
    let run = pipeline
        .coordinator()
        .run(labels(3), |_| Ok(ItemStatus::Done))
        .unwrap();
    run.cancel();
    run.wait();

    let report = pipeline
        .coordinator()
        .run_to_completion(labels(4), |_| Ok(ItemStatus::Done))
        .unwrap();
    assert_eq!(report.succeeded, 4);
}

#[test]
fn pipeline_refuses_invalid_config() {
    let mut config = VidxConfig::default();
    config.storyboard.jpeg_quality = 101;
    assert!(Pipeline::from_config(config, Arc::new(MemoryCatalog::new())).is_err());
}
