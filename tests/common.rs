use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use convergefs::vfs::{
    CompletionSink, ConvergenceFs, FileHandle, FileSystemOps, IoRequest, Issued, MountOptions,
    Status,
};
use tempfile::TempDir;

/// Get the path to the convergefs binary for testing.
#[allow(dead_code)]
pub fn get_convergefs_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("convergefs").to_path_buf()
}

/// Isolated physical roots for one union: a write target plus any number
/// of read-only virtual folders, all under a single temp directory.
/// Used by various test files - #[allow(dead_code)] because not all tests use all fields.
#[allow(dead_code)]
pub struct UnionWorkspace {
    pub temp_dir: TempDir,
    pub write_target: PathBuf,
    pub folders: Vec<PathBuf>,
    pub config_dir: PathBuf,
}

#[allow(dead_code)]
impl UnionWorkspace {
    /// `folder_count` read-only folders named `folder0`, `folder1`, ... in
    /// registration order.
    pub fn new(folder_count: usize) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let write_target = temp_dir.path().join("upper");
        fs::create_dir_all(&write_target).expect("Failed to create write target");

        let folders = (0..folder_count)
            .map(|i| {
                let folder = temp_dir.path().join(format!("folder{}", i));
                fs::create_dir_all(&folder).expect("Failed to create folder");
                folder
            })
            .collect();

        let config_dir = temp_dir.path().join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        UnionWorkspace {
            temp_dir,
            write_target,
            folders,
            config_dir,
        }
    }

    pub fn folder(&self, index: usize) -> &Path {
        &self.folders[index]
    }

    /// Write a file below `root`, creating its parent directories.
    pub fn write(&self, root: &Path, relative: &str, content: &str) -> PathBuf {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    pub fn options(&self) -> MountOptions {
        let mut options = MountOptions::new(&self.write_target);
        options.virtual_folders = self.folders.clone();
        options
    }

    pub fn mount(&self) -> ConvergenceFs {
        ConvergenceFs::mount(self.options()).expect("Failed to mount union")
    }

    /// `--write-target`/`--folder` arguments for CLI invocations.
    pub fn root_args(&self) -> Vec<String> {
        let mut args = vec![
            "--write-target".to_string(),
            self.write_target.display().to_string(),
        ];
        for folder in &self.folders {
            args.push("--folder".to_string());
            args.push(folder.display().to_string());
        }
        args
    }
}

/// Completion sink that forwards every completion to a channel.
pub struct ChannelSink {
    tx: Sender<(IoRequest, Status)>,
}

#[allow(dead_code)]
impl ChannelSink {
    pub fn new() -> (Arc<dyn CompletionSink>, Receiver<(IoRequest, Status)>) {
        let (tx, rx) = channel();
        (Arc::new(ChannelSink { tx }), rx)
    }
}

impl CompletionSink for ChannelSink {
    fn complete(&self, request: IoRequest, status: Status) {
        let _ = self.tx.send((request, status));
    }
}

/// Wait for an issued transfer whichever way it completes.
#[allow(dead_code)]
pub fn settle(issued: Issued, rx: &Receiver<(IoRequest, Status)>) -> (IoRequest, Status) {
    match issued {
        Issued::Completed(request, status) => (request, status),
        Issued::Pending => rx
            .recv_timeout(Duration::from_secs(10))
            .expect("async completion never arrived"),
    }
}

#[allow(dead_code)]
pub fn write_at(fs: &dyn FileSystemOps, handle: FileHandle, offset: u64, data: &[u8]) -> u64 {
    let (sink, rx) = ChannelSink::new();
    let issued = fs.write_file(handle, IoRequest::write(offset, offset, data.to_vec()), &sink);
    let (request, status) = settle(issued, &rx);
    assert_eq!(status, Status::Success, "write failed");
    request.bytes_transferred
}

#[allow(dead_code)]
pub fn read_at(fs: &dyn FileSystemOps, handle: FileHandle, offset: u64, length: usize) -> Vec<u8> {
    let (sink, rx) = ChannelSink::new();
    let issued = fs.read_file(handle, IoRequest::read(offset, offset, length), &sink);
    let (request, status) = settle(issued, &rx);
    assert_eq!(status, Status::Success, "read failed");
    let n = request.bytes_transferred as usize;
    request.buffer[..n].to_vec()
}
