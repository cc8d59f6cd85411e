use asset_hub::state::data::ChildEntry;
use asset_hub::{
    AssetKind, Coordinator, CoordinatorState, HashMode, HubConfig, IndexEvent, RescanTarget, ThumbnailSource,
};
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Library {
    _dir: TempDir,
    root: PathBuf,
    coordinator: Arc<Coordinator>,
}

fn library(configure: impl FnOnce(&mut HubConfig)) -> Library {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("assets");
    fs::create_dir_all(&root).unwrap();

    let mut config = HubConfig::in_directory(dir.path().join("hub"));
    config.root_paths = vec![root.clone()];
    configure(&mut config);
    let coordinator = Coordinator::open(config).unwrap();

    Library {
        _dir: dir,
        root,
        coordinator,
    }
}

fn write_file(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn write_png(path: &Path, width: u32, height: u32, color: [u8; 3]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(width, height, Rgb(color)).save(path).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_model_with_same_name_image_uses_it_as_thumbnail() {
    let lib = library(|_| {});
    write_file(&lib.root.join("vehicles/car.fbx"), b"Kaydara FBX Binary");
    write_png(&lib.root.join("vehicles/car.png"), 640, 320, [200, 30, 30]);

    let report = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(report.added, 1, "the preview image is not a separate asset");
    assert!(report.thumbnail_failures.is_empty());

    let car = lib
        .coordinator
        .index()
        .find_by_path(&lib.root.join("vehicles/car.fbx"))
        .unwrap()
        .unwrap();
    assert_eq!(car.kind, AssetKind::Model);
    assert_eq!(car.companion.as_ref().unwrap().path, lib.root.join("vehicles/car.png"));
    let thumbnail = car.thumbnail.clone().unwrap();
    assert_eq!(thumbnail.source, ThumbnailSource::MatchedImage);

    let entry = lib.coordinator.store().lookup(&thumbnail.key).await.unwrap();
    assert_eq!(entry.origin, Some(lib.root.join("vehicles/car.png")));
    assert_eq!((entry.width, entry.height), (256, 128));

    let bytes = lib.coordinator.get_thumbnail_bytes(car.id).await.unwrap();
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (256, 128));
}

#[tokio::test]
async fn test_model_without_decoder_gets_placeholder() {
    let lib = library(|config| config.decoder_enabled = false);
    write_file(&lib.root.join("chair.obj"), b"v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n");
    write_png(&lib.root.join("chair.png"), 64, 64, [10, 200, 10]);

    let report = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(report.added, 1);
    // No decoder is a capability, not a failure
    assert!(report.thumbnail_failures.is_empty());

    let chair = lib
        .coordinator
        .index()
        .find_by_path(&lib.root.join("chair.obj"))
        .unwrap()
        .unwrap();
    assert_eq!(chair.thumbnail.as_ref().unwrap().source, ThumbnailSource::Placeholder);
    let bytes = lib.coordinator.get_thumbnail_bytes(chair.id).await.unwrap();
    assert!(!bytes.is_empty());
}

#[tokio::test]
async fn test_corrupt_image_falls_back_and_is_reported() {
    let lib = library(|_| {});
    write_file(&lib.root.join("broken.png"), b"definitely not a png");

    let report = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.thumbnail_failures.len(), 1);
    assert_eq!(report.thumbnail_failures[0].path, lib.root.join("broken.png"));

    let broken = lib
        .coordinator
        .index()
        .find_by_path(&lib.root.join("broken.png"))
        .unwrap()
        .unwrap();
    assert_eq!(broken.kind, AssetKind::Image);
    assert_eq!(broken.thumbnail.unwrap().source, ThumbnailSource::Placeholder);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unchanged_library_is_idempotent() {
    let lib = library(|_| {});
    write_file(&lib.root.join("props/barrel.obj"), b"v 0 0 0");
    write_file(&lib.root.join("props/crate.fbx"), b"fbx");
    write_png(&lib.root.join("props/crate.png"), 32, 32, [1, 2, 3]);
    write_png(&lib.root.join("textures/wood.jpg"), 16, 16, [120, 80, 40]);

    let first = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(first.added, 3);
    let generated = lib.coordinator.pipeline().invocations();
    assert_eq!(generated, 3);

    let mut events = lib.coordinator.subscribe();
    let second = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(second.change_count(), 0);
    assert_eq!(lib.coordinator.pipeline().invocations(), generated);
    assert!(!std::iter::from_fn(|| events.try_recv().ok())
        .any(|event| matches!(event, IndexEvent::IndexChanged { .. })));
}

#[tokio::test]
async fn test_modified_companion_regenerates_thumbnail() {
    let lib = library(|config| {
        config.hash_mode = HashMode::Partial { sample_bytes: 4096 };
    });
    let model = lib.root.join("tree.blend");
    write_file(&model, b"BLENDER");
    write_png(&lib.root.join("tree.png"), 32, 32, [0, 120, 0]);
    lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    let before = lib.coordinator.index().find_by_path(&model).unwrap().unwrap();

    write_png(&lib.root.join("tree.png"), 48, 48, [120, 0, 0]);
    let report = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(report.updated, 1);

    let after = lib.coordinator.index().find_by_path(&model).unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_ne!(after.thumbnail.unwrap().key, before.thumbnail.unwrap().key);
    assert_eq!(lib.coordinator.pipeline().invocations(), 2);
}

#[tokio::test]
async fn test_tree_round_trip() {
    let lib = library(|config| config.decoder_enabled = false);
    write_file(&lib.root.join("characters/hero.fbx"), b"hero");
    write_file(&lib.root.join("characters/villain.FBX"), b"villain");
    write_file(&lib.root.join("Zeppelin.glb"), b"glTF");
    write_file(&lib.root.join("notes.txt"), b"not an asset");
    lib.coordinator.rescan(RescanTarget::All).await.unwrap();

    let roots = lib.coordinator.list_roots().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].path, lib.root);

    let children = lib.coordinator.list_children(roots[0].id).unwrap();
    let names: Vec<&str> = children.iter().map(ChildEntry::name).collect();
    assert_eq!(names, vec!["characters", "Zeppelin.glb"]);

    let ChildEntry::Folder(characters) = &children[0] else {
        panic!("expected characters folder first");
    };
    let assets = lib.coordinator.list_children(characters.id).unwrap();
    assert_eq!(assets.len(), 2);
    for child in assets {
        let ChildEntry::Asset(asset) = child else {
            panic!("unexpected folder");
        };
        let fetched = lib.coordinator.get_asset(asset.id).unwrap().unwrap();
        assert_eq!(fetched.path, asset.path);
        assert_eq!(fetched.kind, AssetKind::Model);
        assert_eq!(fetched.fingerprint, asset.fingerprint);
        assert_eq!(fetched.fingerprint.size, fs::metadata(&asset.path).unwrap().len());
    }
}

#[tokio::test]
async fn test_deleting_folder_contents_prunes_records_and_folders() {
    let lib = library(|config| config.decoder_enabled = false);
    write_file(&lib.root.join("env/rocks/big/rock.obj"), b"rock");
    write_file(&lib.root.join("env/rocks/pebble.obj"), b"pebble");
    write_file(&lib.root.join("hero.fbx"), b"hero");
    lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(lib.coordinator.index().count_assets().unwrap(), 3);

    fs::remove_dir_all(lib.root.join("env")).unwrap();
    let report = lib.coordinator.rescan(RescanTarget::All).await.unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(report.folders_pruned, 3);
    let index = lib.coordinator.index();
    assert_eq!(index.count_assets().unwrap(), 1);
    assert!(index.find_folder_by_path(&lib.root.join("env")).unwrap().is_none());
    assert!(index.find_by_path(&lib.root.join("env/rocks/pebble.obj")).unwrap().is_none());
}

#[tokio::test]
async fn test_folder_rescan_only_touches_that_subtree() {
    let lib = library(|config| config.decoder_enabled = false);
    write_file(&lib.root.join("props/a.obj"), b"a");
    write_file(&lib.root.join("other/b.obj"), b"b");
    lib.coordinator.rescan(RescanTarget::All).await.unwrap();

    write_file(&lib.root.join("props/c.obj"), b"c");
    write_file(&lib.root.join("other/d.obj"), b"d");
    let props = lib
        .coordinator
        .index()
        .find_folder_by_path(&lib.root.join("props"))
        .unwrap()
        .unwrap();
    let report = lib.coordinator.rescan(RescanTarget::Folder(props.id)).await.unwrap();

    assert_eq!(report.added, 1);
    assert!(lib.coordinator.index().find_by_path(&lib.root.join("other/d.obj")).unwrap().is_none());
}

#[tokio::test]
async fn test_sub_folder_scanned_first_joins_the_root_tree() {
    let lib = library(|config| config.decoder_enabled = false);
    write_file(&lib.root.join("hero.fbx"), b"hero");
    write_file(&lib.root.join("props/barrel.obj"), b"barrel");

    let first = lib.coordinator.rescan(RescanTarget::Root(lib.root.join("props"))).await.unwrap();
    assert_eq!(first.added, 1);
    lib.coordinator.rescan(RescanTarget::All).await.unwrap();

    let roots = lib.coordinator.list_roots().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].path, lib.root);
    let children = lib.coordinator.list_children(roots[0].id).unwrap();
    let names: Vec<&str> = children.iter().map(ChildEntry::name).collect();
    assert_eq!(names, vec!["props", "hero.fbx"]);
    assert_eq!(lib.coordinator.index().list_assets_recursive(roots[0].id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelled_scan_leaves_index_untouched() {
    let lib = library(|config| config.decoder_enabled = false);
    write_file(&lib.root.join("keep.obj"), b"keep");
    lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    let before = lib.coordinator.index().snapshot(&lib.root).unwrap();

    fs::remove_file(lib.root.join("keep.obj")).unwrap();
    write_file(&lib.root.join("new.obj"), b"new");
    let token = CancellationToken::new();
    token.cancel();
    let mut events = lib.coordinator.subscribe();

    let err = lib.coordinator.rescan_with(RescanTarget::All, token).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(lib.coordinator.state(), CoordinatorState::Cancelled);
    assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|event| event == IndexEvent::ScanCancelled));

    let after = lib.coordinator.index().snapshot(&lib.root).unwrap();
    assert_eq!(after.entries, before.entries);

    // The next scan picks everything up
    let report = lib.coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!((report.added, report.removed), (1, 1));
    assert_eq!(lib.coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("assets");
    write_file(&root.join("lamp.gltf"), b"{}");
    let mut config = HubConfig::in_directory(dir.path().join("hub"));
    config.root_paths = vec![root.clone()];

    {
        let coordinator = Coordinator::open(config.clone()).unwrap();
        coordinator.rescan(RescanTarget::All).await.unwrap();
    }

    let coordinator = Coordinator::open(config).unwrap();
    let report = coordinator.rescan(RescanTarget::All).await.unwrap();
    assert_eq!(report.change_count(), 0);
    assert_eq!(coordinator.pipeline().invocations(), 0);
    assert!(coordinator.index().find_by_path(&root.join("lamp.gltf")).unwrap().is_some());
}
