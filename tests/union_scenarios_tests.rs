mod common;

use common::{read_at, write_at, UnionWorkspace};
use convergefs::vfs::{
    Access, ConvergenceFs, Disposition, EntryKind, FileHandle, FileSystemOps, OpenRequest, Status,
};
use std::fs;

#[test]
fn test_folder_entry_resolves_to_folder() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "docs/readme.txt", "from folder");
    let union_fs = workspace.mount();

    let (physical, root) = union_fs.resolve("docs/readme.txt").unwrap();
    assert_eq!(physical, workspace.folder(0).join("docs/readme.txt"));
    assert!(!root.is_write_target());
    assert_eq!(root.index(), 1, "first registered folder");
}

#[test]
fn test_creating_over_folder_entry_shadows_it() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "docs/readme.txt", "from folder");
    let union_fs = workspace.mount();

    let opened = union_fs
        .create_file(
            "docs/readme.txt",
            &OpenRequest::create_file(Disposition::OverwriteIf),
        )
        .unwrap();
    write_at(&union_fs, opened.handle, 0, b"fresh");
    union_fs.cleanup(opened.handle).unwrap();
    union_fs.close_file(opened.handle).unwrap();

    let (physical, root) = union_fs.resolve("/docs/readme.txt").unwrap();
    assert_eq!(physical, workspace.write_target.join("docs/readme.txt"));
    assert!(root.is_write_target());
    assert_eq!(fs::read_to_string(&physical).unwrap(), "fresh");
    assert_eq!(
        fs::read_to_string(workspace.folder(0).join("docs/readme.txt")).unwrap(),
        "from folder",
        "read-only folder is never modified"
    );
}

#[test]
fn test_write_open_copies_content_up() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "notes.txt", "0123456789");
    let union_fs = workspace.mount();

    let opened = union_fs
        .create_file("notes.txt", &OpenRequest::open_existing(Access::read_write()))
        .unwrap();
    write_at(&union_fs, opened.handle, 2, b"ab");
    assert_eq!(read_at(&union_fs, opened.handle, 0, 64), b"01ab456789");
    union_fs.cleanup(opened.handle).unwrap();
    union_fs.close_file(opened.handle).unwrap();

    assert_eq!(
        fs::read_to_string(workspace.write_target.join("notes.txt")).unwrap(),
        "01ab456789"
    );
    assert_eq!(
        fs::read_to_string(workspace.folder(0).join("notes.txt")).unwrap(),
        "0123456789"
    );
}

#[test]
fn test_newest_folder_wins() {
    let workspace = UnionWorkspace::new(2);
    workspace.write(workspace.folder(0), "cfg/app.ini", "A");
    workspace.write(workspace.folder(1), "cfg/app.ini", "B");
    let union_fs = workspace.mount();

    let (physical, _) = union_fs.resolve("cfg/app.ini").unwrap();
    assert_eq!(physical, workspace.folder(1).join("cfg/app.ini"));

    let opened = union_fs
        .create_file("cfg/app.ini", &OpenRequest::open_existing(Access::read_only()))
        .unwrap();
    assert_eq!(read_at(&union_fs, opened.handle, 0, 16), b"B");
    union_fs.cleanup(opened.handle).unwrap();
    union_fs.close_file(opened.handle).unwrap();
}

#[test]
fn test_write_target_wins_over_every_folder() {
    let workspace = UnionWorkspace::new(2);
    workspace.write(workspace.folder(0), "same.txt", "A");
    workspace.write(workspace.folder(1), "same.txt", "B");
    workspace.write(&workspace.write_target, "same.txt", "W");
    let union_fs = workspace.mount();

    let (physical, root) = union_fs.resolve("same.txt").unwrap();
    assert_eq!(physical, workspace.write_target.join("same.txt"));
    assert!(root.is_write_target());
}

#[test]
fn test_delete_falls_back_to_next_root() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "docs/readme.txt", "lower");
    workspace.write(&workspace.write_target, "docs/readme.txt", "upper");
    let union_fs = workspace.mount();

    union_fs.delete_file("docs/readme.txt").unwrap();

    assert!(!workspace.write_target.join("docs/readme.txt").exists());
    let (physical, root) = union_fs.resolve("docs/readme.txt").unwrap();
    assert_eq!(physical, workspace.folder(0).join("docs/readme.txt"));
    assert!(!root.is_write_target());
}

#[test]
fn test_delete_of_only_copy_leaves_nothing() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(&workspace.write_target, "docs/only.txt", "upper");
    let union_fs = workspace.mount();

    union_fs.delete_file("docs/only.txt").unwrap();

    assert!(union_fs.tree().lookup("docs/only.txt", EntryKind::Any).is_none());
    let err = union_fs
        .create_file("docs/only.txt", &OpenRequest::open_existing(Access::read_only()))
        .unwrap_err();
    assert_eq!(err, Status::ObjectNameNotFound);
}

#[test]
fn test_delete_waits_for_last_handle() {
    let workspace = UnionWorkspace::new(0);
    workspace.write(&workspace.write_target, "busy.txt", "data");
    let union_fs = workspace.mount();

    let reader = union_fs
        .create_file("busy.txt", &OpenRequest::open_existing(Access::read_only()))
        .unwrap();
    union_fs.delete_file("busy.txt").unwrap();
    assert!(
        workspace.write_target.join("busy.txt").exists(),
        "delete is deferred while another handle is open"
    );

    let err = union_fs
        .create_file("busy.txt", &OpenRequest::open_existing(Access::read_only()))
        .unwrap_err();
    assert_eq!(err, Status::DeletePending);

    union_fs.cleanup(reader.handle).unwrap();
    union_fs.close_file(reader.handle).unwrap();
    assert!(!workspace.write_target.join("busy.txt").exists());
}

#[test]
fn test_kind_mismatch_is_reported() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "dir/file.txt", "x");
    let union_fs = workspace.mount();

    let mut as_file = OpenRequest::open_existing(Access::read_only());
    as_file.options.non_directory_file = true;
    assert_eq!(
        union_fs.create_file("dir", &as_file).unwrap_err(),
        Status::FileIsADirectory
    );

    let mut as_dir = OpenRequest::open_existing(Access::read_only());
    as_dir.options.directory_file = true;
    assert_eq!(
        union_fs.create_file("dir/file.txt", &as_dir).unwrap_err(),
        Status::NotADirectory
    );

    assert_eq!(
        union_fs.delete_directory("dir").unwrap_err(),
        Status::DirectoryNotEmpty
    );
}

#[test]
fn test_create_collision_and_missing_parent() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "a.txt", "x");
    let union_fs = workspace.mount();

    assert_eq!(
        union_fs
            .create_file("a.txt", &OpenRequest::create_file(Disposition::Create))
            .unwrap_err(),
        Status::ObjectNameCollision
    );
    assert_eq!(
        union_fs
            .create_file("nope/b.txt", &OpenRequest::create_file(Disposition::Create))
            .unwrap_err(),
        Status::ObjectPathNotFound
    );
}

#[test]
fn test_directories_merge_across_roots() {
    let workspace = UnionWorkspace::new(2);
    workspace.write(workspace.folder(0), "shared/from_a.txt", "a");
    workspace.write(workspace.folder(1), "shared/from_b.txt", "b");
    workspace.write(&workspace.write_target, "shared/from_w.txt", "w");
    let union_fs = workspace.mount();

    let mut as_dir = OpenRequest::open_existing(Access::read_only());
    as_dir.options.directory_file = true;
    let dir = union_fs.create_file("shared", &as_dir).unwrap();
    let mut names: Vec<String> = union_fs
        .find_files(dir.handle)
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["from_a.txt", "from_b.txt", "from_w.txt"]);

    let matched = union_fs.find_files_with_pattern(dir.handle, "FROM_[ab]*").unwrap();
    assert_eq!(matched.len(), 2);

    union_fs.cleanup(dir.handle).unwrap();
    union_fs.close_file(dir.handle).unwrap();
}

#[test]
fn test_rebuild_is_idempotent() {
    let workspace = UnionWorkspace::new(2);
    workspace.write(workspace.folder(0), "a/b/c.txt", "1");
    workspace.write(workspace.folder(1), "a/d.txt", "2");
    workspace.write(&workspace.write_target, "a/b/e.txt", "3");
    let union_fs = workspace.mount();

    let first_count = union_fs.node_count();
    let first: Vec<_> = union_fs
        .listing()
        .into_iter()
        .map(|entry| (entry.path, entry.root))
        .collect();

    let rebuilt = union_fs.rebuild().unwrap();
    let second: Vec<_> = union_fs
        .listing()
        .into_iter()
        .map(|entry| (entry.path, entry.root))
        .collect();

    assert_eq!(rebuilt, first_count);
    assert_eq!(union_fs.node_count(), first_count);
    assert_eq!(first, second);
}

#[test]
fn test_rename_within_directory() {
    let workspace = UnionWorkspace::new(0);
    workspace.write(&workspace.write_target, "dir/a", "payload");
    let union_fs = workspace.mount();

    let opened = union_fs
        .create_file(
            "dir/a",
            &OpenRequest::open_existing(Access {
                delete: true,
                ..Default::default()
            }),
        )
        .unwrap();
    union_fs.move_file(opened.handle, "dir/b", false).unwrap();
    union_fs.cleanup(opened.handle).unwrap();
    union_fs.close_file(opened.handle).unwrap();

    assert!(union_fs.tree().lookup("dir/a", EntryKind::Any).is_none());
    assert!(union_fs.tree().lookup("dir/b", EntryKind::File).is_some());
    assert_eq!(
        fs::read_to_string(workspace.write_target.join("dir/b")).unwrap(),
        "payload"
    );
}

#[test]
fn test_unmount_closes_everything() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "x.txt", "x");
    let union_fs = workspace.mount();

    let _left_open = union_fs
        .create_file("x.txt", &OpenRequest::open_existing(Access::read_only()))
        .unwrap();
    assert_eq!(union_fs.open_handles(), 1);

    union_fs.unmount().unwrap();
    assert_eq!(union_fs.open_handles(), 0);
    let stats = union_fs.context_stats();
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(union_fs.node_count(), 1, "only the root survives");
}

fn open_for_move(union_fs: &ConvergenceFs, path: &str, directory: bool) -> FileHandle {
    let mut request = OpenRequest::open_existing(Access {
        delete: true,
        ..Default::default()
    });
    if directory {
        request.options.directory_file = true;
    } else {
        request.options.non_directory_file = true;
    }
    union_fs.create_file(path, &request).unwrap().handle
}

fn finish(union_fs: &ConvergenceFs, handle: FileHandle) {
    union_fs.cleanup(handle).unwrap();
    union_fs.close_file(handle).unwrap();
}

#[test]
fn test_move_across_directories() {
    let workspace = UnionWorkspace::new(0);
    workspace.write(&workspace.write_target, "src/a.txt", "payload");
    fs::create_dir_all(workspace.write_target.join("dst")).unwrap();
    let union_fs = workspace.mount();
    let before = union_fs.tree().lookup("src/a.txt", EntryKind::File).unwrap();

    let handle = open_for_move(&union_fs, "src/a.txt", false);
    union_fs.move_file(handle, "dst/a.txt", false).unwrap();
    finish(&union_fs, handle);

    assert!(union_fs.tree().lookup("src/a.txt", EntryKind::Any).is_none());
    assert_eq!(union_fs.tree().lookup("dst/a.txt", EntryKind::File), Some(before));
    assert!(!workspace.write_target.join("src/a.txt").exists());
    assert_eq!(
        fs::read_to_string(workspace.write_target.join("dst/a.txt")).unwrap(),
        "payload"
    );
}

#[test]
fn test_directory_move_remerges_lower_roots() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(&workspace.write_target, "proj/own.txt", "w");
    workspace.write(workspace.folder(0), "proj/lower.txt", "a");
    let union_fs = workspace.mount();
    let dir = union_fs.tree().lookup("proj", EntryKind::Folder).unwrap();
    let own = union_fs.tree().lookup("proj/own.txt", EntryKind::File).unwrap();

    let handle = open_for_move(&union_fs, "proj", true);
    union_fs.move_file(handle, "renamed", false).unwrap();
    finish(&union_fs, handle);

    let tree = union_fs.tree();
    assert_eq!(tree.lookup("renamed", EntryKind::Folder), Some(dir));
    assert_eq!(tree.lookup("renamed/own.txt", EntryKind::File), Some(own));
    // Only the write target's directory moved.
    assert!(tree.lookup("renamed/lower.txt", EntryKind::Any).is_none());

    // The folder's own copy of the old path is still part of the union.
    let (physical, root) = union_fs.resolve("proj/lower.txt").unwrap();
    assert_eq!(physical, workspace.folder(0).join("proj/lower.txt"));
    assert_eq!(root.index(), 1);
    assert!(tree.lookup("proj/own.txt", EntryKind::Any).is_none());
}

#[test]
fn test_replace_move_with_second_handle_open() {
    let workspace = UnionWorkspace::new(0);
    workspace.write(&workspace.write_target, "src.txt", "payload");
    workspace.write(&workspace.write_target, "dst.txt", "old");
    let union_fs = workspace.mount();

    let reader = union_fs
        .create_file("src.txt", &OpenRequest::open_existing(Access::read_only()))
        .unwrap();
    let mover = open_for_move(&union_fs, "src.txt", false);
    union_fs.move_file(mover, "dst.txt", true).unwrap();

    assert_eq!(read_at(&union_fs, reader.handle, 0, 16), b"payload");
    finish(&union_fs, reader.handle);
    finish(&union_fs, mover);
    assert_eq!(union_fs.open_handles(), 0);

    union_fs.delete_file("dst.txt").unwrap();
    assert!(!workspace.write_target.join("dst.txt").exists());
    assert_eq!(
        union_fs
            .create_file("dst.txt", &OpenRequest::open_existing(Access::read_only()))
            .unwrap_err(),
        Status::ObjectNameNotFound
    );
}

#[test]
fn test_move_never_touches_read_only_folder() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "a.txt", "lower");
    let union_fs = workspace.mount();

    let handle = open_for_move(&union_fs, "a.txt", false);
    union_fs.move_file(handle, "b.txt", false).unwrap();
    finish(&union_fs, handle);

    assert!(workspace.folder(0).join("a.txt").exists());
    assert!(!workspace.folder(0).join("b.txt").exists());
    assert_eq!(
        fs::read_to_string(workspace.write_target.join("b.txt")).unwrap(),
        "lower"
    );
    let (_, root) = union_fs.resolve("b.txt").unwrap();
    assert!(root.is_write_target());
}

#[test]
fn test_directory_move_from_read_only_folder() {
    let workspace = UnionWorkspace::new(1);
    workspace.write(workspace.folder(0), "lib/x.txt", "x");
    workspace.write(workspace.folder(0), "lib/sub/y.txt", "y");
    let union_fs = workspace.mount();

    let handle = open_for_move(&union_fs, "lib", true);
    union_fs.move_file(handle, "lib2", false).unwrap();
    finish(&union_fs, handle);

    assert!(!workspace.folder(0).join("lib2").exists());
    assert!(workspace.folder(0).join("lib/sub/y.txt").exists());
    assert_eq!(
        fs::read_to_string(workspace.write_target.join("lib2/sub/y.txt")).unwrap(),
        "y"
    );
    for path in ["lib2/x.txt", "lib2/sub/y.txt"] {
        let (_, root) = union_fs.resolve(path).unwrap();
        assert!(root.is_write_target(), "{} lives in the write target", path);
    }
}
