//! Shared fixtures: a throwaway install layout, fake service/source/fetcher,
//! a failure-injecting filesystem and a one-shot HTTP responder.

#![allow(dead_code)]

use async_trait::async_trait;
use devicebox_common::config::InstallConfig;
use devicebox_common::fsops::{FsError, FsOp};
use devicebox_common::{tree_digest, BuildVersion, FileSystem, LocalFs, UpdateError, VersionStore};
use devicebox_update::{
    ArtifactFetcher, InstallContext, PollBudget, ReleaseDescriptor, ReleaseSource,
    ServiceController, StagedRelease,
};
use std::fs;
use std::io::{self, Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Marker file: a release containing it never reports active.
pub const CRASH_MARKER: &str = "CRASHES_ON_START";

pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }
}

pub fn version(s: &str) -> BuildVersion {
    BuildVersion::parse(s).unwrap()
}

pub fn release(v: &str, url: &str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        version: version(v),
        fetch_location: url.to_string(),
        published_at: None,
        notes: format!("DeviceBox {}", v),
        source_identifier: format!("v{}", v),
    }
}

/// A fake appliance under a temp directory.
pub struct Layout {
    pub temp: TempDir,
    pub install: InstallConfig,
}

impl Layout {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let opt = temp.path().join("opt");
        fs::create_dir_all(&opt).unwrap();

        let install = InstallConfig {
            install_dir: opt.join("devicebox"),
            version_file: temp.path().join("var/lib/devicebox/version.json"),
            scratch_dir: opt.join(".devicebox-update"),
            backup_dir: opt.join(".devicebox-backup"),
            preserved_paths: ["data", "config.json", "devices.json", "logs"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            executable_files: vec![PathBuf::from("app.py")],
            service_user: None,
            verify_rollback_digest: true,
        };
        Self { temp, install }
    }

    pub fn live(&self) -> &Path {
        &self.install.install_dir
    }

    pub fn store(&self) -> VersionStore {
        VersionStore::new(&self.install.version_file)
    }

    /// Live tree of 1.0.3 with user data, recorded as installed.
    pub fn seed_installed(&self) {
        write_tree(
            self.live(),
            &[
                ("app.py", "print('1.0.3')\n"),
                ("device_manager.py", "DEVICES = []\n"),
                ("templates/index.html", "<h1>DeviceBox 1.0.3</h1>"),
                ("data/labels/shipping.json", "{\"width\": 102}"),
                ("config.json", "{\"printer\": \"zebra-zd421\"}"),
                ("logs/devicebox.log", "started\n"),
            ],
        );
        self.store().record(&version("1.0.3"), "v1.0.3").unwrap();
    }

    /// Unpacked 1.1.0 release tree; returns its top-level directory.
    pub fn release_tree(&self, name: &str, extra: &[(&str, &str)]) -> PathBuf {
        let root = self.temp.path().join("releases").join(name);
        write_tree(
            &root,
            &[
                ("app.py", "print('1.1.0')\n"),
                ("device_manager.py", "DEVICES = ['scanner']\n"),
                ("templates/index.html", "<h1>DeviceBox 1.1.0</h1>"),
                ("static/app.js", "console.log('1.1.0');"),
                ("config.json", "{\"printer\": null}"),
            ],
        );
        write_tree(&root, extra);
        fs::set_permissions(root.join("app.py"), fs::Permissions::from_mode(0o644)).unwrap();
        root
    }

    pub fn live_digest(&self) -> String {
        tree_digest(self.live()).unwrap()
    }

    pub fn context(&self, fs: Arc<dyn FileSystem>, service: Arc<FakeService>) -> InstallContext {
        InstallContext {
            install: self.install.clone(),
            store: self.store(),
            fs,
            service,
            liveness: PollBudget::new(3, Duration::from_millis(5)),
        }
    }

    pub fn scratch_entries(&self) -> usize {
        count_entries(&self.install.scratch_dir)
    }

    pub fn backup_entries(&self) -> usize {
        count_entries(&self.install.backup_dir)
    }
}

fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

type StartHook = Box<dyn FnOnce() + Send>;

/// Service that is active while "running" unless the live tree carries
/// [`CRASH_MARKER`]. Like `systemctl start`, starting a running service
/// does nothing: it keeps running the tree it was started from.
pub struct FakeService {
    live: PathBuf,
    running: AtomicBool,
    /// Digest of the tree the running process was started from
    started_from: Mutex<Option<String>>,
    on_first_start: Mutex<Option<StartHook>>,
    pub stops: AtomicU32,
    pub starts: AtomicU32,
}

impl FakeService {
    pub fn new(live: &Path) -> Arc<Self> {
        Arc::new(Self::build(live, None))
    }

    /// Runs `hook` right after the first start.
    pub fn with_start_hook<F>(live: &Path, hook: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self::build(live, Some(Box::new(hook))))
    }

    fn build(live: &Path, hook: Option<StartHook>) -> Self {
        Self {
            live: live.to_path_buf(),
            running: AtomicBool::new(true),
            started_from: Mutex::new(tree_digest(live).ok()),
            on_first_start: Mutex::new(hook),
            stops: AtomicU32::new(0),
            starts: AtomicU32::new(0),
        }
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Digest of the tree the service is running from, if running.
    pub fn running_tree(&self) -> Option<String> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        self.started_from.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceController for FakeService {
    fn name(&self) -> &str {
        "devicebox"
    }

    async fn stop(&self) -> Result<(), UpdateError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        *self.started_from.lock().unwrap() = None;
        Ok(())
    }

    async fn start(&self) -> Result<(), UpdateError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.running.swap(true, Ordering::SeqCst) {
            *self.started_from.lock().unwrap() = tree_digest(&self.live).ok();
        }
        let hook = self.on_first_start.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.live.join(CRASH_MARKER).exists()
    }
}

/// Always reports the same release, or `NoReleases`.
pub struct StaticSource(pub Option<ReleaseDescriptor>);

#[async_trait]
impl ReleaseSource for StaticSource {
    fn describe(&self) -> String {
        "static".to_string()
    }

    async fn latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        self.0.clone().ok_or(UpdateError::NoReleases)
    }
}

/// Stages a copy of a prepared tree, optionally waiting on a gate first.
pub struct DirFetcher {
    template: PathBuf,
    scratch: PathBuf,
    gate: Option<Arc<Notify>>,
    pub calls: AtomicU32,
}

impl DirFetcher {
    pub fn new(template: &Path, scratch: &Path) -> Self {
        Self {
            template: template.to_path_buf(),
            scratch: scratch.to_path_buf(),
            gate: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for DirFetcher {
    async fn fetch(&self, release: &ReleaseDescriptor) -> Result<StagedRelease, UpdateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        fs::create_dir_all(&self.scratch).unwrap();
        let workdir = tempfile::Builder::new()
            .prefix("fetch-")
            .tempdir_in(&self.scratch)
            .unwrap();
        let name = self.template.file_name().unwrap();
        let root = workdir.path().join("extracted").join(name);
        LocalFs.copy_tree(&self.template, &root).unwrap();
        Ok(StagedRelease::new(workdir, root, release.clone()))
    }
}

type FailRule = Box<dyn Fn(FsOp, &Path) -> bool + Send + Sync>;

/// Real filesystem with injected failures.
#[derive(Default)]
pub struct FailingFs {
    rules: Vec<FailRule>,
}

impl FailingFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `op` when its source path satisfies `pred`.
    pub fn fail_when<F>(mut self, op: FsOp, pred: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.rules
            .push(Box::new(move |o, p| o == op && pred(p)));
        self
    }

    fn check(&self, op: FsOp, path: &Path) -> Result<(), FsError> {
        if self.rules.iter().any(|rule| rule(op, path)) {
            return Err(FsError::new(
                op,
                path,
                io::Error::new(io::ErrorKind::Other, "injected failure"),
            ));
        }
        Ok(())
    }
}

impl FileSystem for FailingFs {
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        self.check(FsOp::Rename, from)?;
        LocalFs.rename(from, to)
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        self.check(FsOp::CopyTree, from)?;
        LocalFs.copy_tree(from, to)
    }

    fn remove_tree(&self, path: &Path) -> Result<(), FsError> {
        self.check(FsOp::RemoveTree, path)?;
        LocalFs.remove_tree(path)
    }

    fn set_owner(&self, path: &Path, user: &str) -> Result<(), FsError> {
        self.check(FsOp::SetOwner, path)?;
        LocalFs.set_owner(path, user)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.check(FsOp::SetMode, path)?;
        LocalFs.set_mode(path, mode)
    }
}

/// What the test HTTP server answers to every request.
#[derive(Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    /// Content-Length to announce; defaults to the body length
    pub declared_len: Option<usize>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            declared_len: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: b"{\"message\": \"error\"}".to_vec(),
            declared_len: None,
        }
    }
}

/// Serve `reply` on 127.0.0.1 until the runtime shuts down. Returns the base URL.
pub async fn serve(reply: Reply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                        break;
                    }
                }

                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                    reply.status,
                    reply.declared_len.unwrap_or(reply.body.len())
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&reply.body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Zip archive bytes. Names ending in `/` become directories.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

pub fn tar_gz_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
