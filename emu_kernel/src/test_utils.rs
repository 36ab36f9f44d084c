//! Fake collaborators for unit and integration tests
//!
//! Every fake records the calls the kernel makes so tests can assert on
//! them, and the ones that can fail during checkpoint and restore consult a
//! shared [`FaultInjector`].
//!
//! Tasks run against a [`ScriptedPlatform`]: each trip into "application
//! code" pops the next [`AppEvent`] of the task's script. A task whose
//! script is exhausted blocks until it is interrupted.

use crate::fault_injection::{FaultInjector, FaultPlan};
use crate::kernel::{CreateProcessArgs, InitKernelArgs, Kernel, KernelDeps};
use core_types::{Errno, FileId, SigAction, SignalInfo, TaskKey};
use identity::{Credentials, UserNamespace};
use kernel_api::{
    AppContext, AppEvent, ArchState, AsyncMemoryFileLoader, Clocks, CompleteRestoreOptions,
    FeatureSet, FileDescription, KernelError, LoadArgs, LoadError, Loader, MemoryFile,
    MemoryManager, MemorySaveOpts, MountNamespace, NetworkStack, Platform, SpecialFilesystem,
    TaskImage, VirtualDentry, VirtualFilesystem,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Feature set reported by the fake host unless a fault overrides it
pub fn test_feature_set() -> FeatureSet {
    FeatureSet::new("GenuineIntel", ["sse2", "sse4_2", "avx", "xsave"])
}

/// Mount namespace handed to the first process
pub fn test_mount_namespace() -> Arc<MountNamespace> {
    Arc::new(MountNamespace {
        id: 1,
        root: VirtualDentry::new(1, "/"),
    })
}

/// Runs tasks from per-task event scripts
pub struct ScriptedPlatform {
    host_features: FeatureSet,
    max_cpu: u32,
    faults: Arc<FaultInjector>,
    default_script: Mutex<Vec<AppEvent>>,
    scripts: Mutex<BTreeMap<TaskKey, VecDeque<AppEvent>>>,
    interrupts: Mutex<BTreeMap<TaskKey, usize>>,
    delivered: Mutex<Vec<(TaskKey, i32)>>,
    switches: AtomicUsize,
}

impl ScriptedPlatform {
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self {
            host_features: test_feature_set(),
            max_cpu: 3,
            faults,
            default_script: Mutex::new(Vec::new()),
            scripts: Mutex::new(BTreeMap::new()),
            interrupts: Mutex::new(BTreeMap::new()),
            delivered: Mutex::new(Vec::new()),
            switches: AtomicUsize::new(0),
        }
    }

    pub fn with_host_features(mut self, features: FeatureSet) -> Self {
        self.host_features = features;
        self
    }

    pub fn with_max_cpu(mut self, max_cpu: u32) -> Self {
        self.max_cpu = max_cpu;
        self
    }

    /// Script given to every task that has none when it first runs
    pub fn set_default_script(&self, events: Vec<AppEvent>) {
        *self.default_script.lock() = events;
    }

    /// Appends events to the script of `task`
    pub fn script(&self, task: TaskKey, events: impl IntoIterator<Item = AppEvent>) {
        self.scripts.lock().entry(task).or_default().extend(events);
    }

    pub fn interrupts(&self, task: TaskKey) -> usize {
        self.interrupts.lock().get(&task).copied().unwrap_or(0)
    }

    /// Signals handed to user handlers, as `(task, signo)`
    pub fn delivered(&self) -> Vec<(TaskKey, i32)> {
        self.delivered.lock().clone()
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }
}

impl Platform for ScriptedPlatform {
    fn host_feature_set(&self) -> FeatureSet {
        self.faults
            .host_features()
            .unwrap_or_else(|| self.host_features.clone())
    }

    fn max_possible_cpu(&self) -> Result<u32, Errno> {
        Ok(self.max_cpu)
    }

    fn switch_to_app(&self, ctx: AppContext<'_>) -> AppEvent {
        self.switches.fetch_add(1, Ordering::SeqCst);
        ctx.arch.instruction_pointer += 1;
        let mut scripts = self.scripts.lock();
        let script = scripts
            .entry(ctx.task)
            .or_insert_with(|| self.default_script.lock().iter().cloned().collect());
        script.pop_front().unwrap_or(AppEvent::Block(None))
    }

    fn interrupt(&self, task: TaskKey) {
        *self.interrupts.lock().entry(task).or_default() += 1;
    }

    fn deliver_signal(
        &self,
        task: TaskKey,
        arch: &mut ArchState,
        info: &SignalInfo,
        _action: &SigAction,
    ) -> Result<(), Errno> {
        arch.stack_pointer = arch.stack_pointer.wrapping_sub(128);
        self.delivered.lock().push((task, info.signo));
        Ok(())
    }
}

static NEXT_FORKED_MM: AtomicU64 = AtomicU64::new(1 << 32);

#[derive(Debug)]
pub struct FakeMemoryManager {
    id: u64,
    invalidations: AtomicUsize,
}

impl FakeMemoryManager {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            invalidations: AtomicUsize::new(0),
        })
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl MemoryManager for FakeMemoryManager {
    fn id(&self) -> u64 {
        self.id
    }

    fn invalidate_unsavable(&self) -> Result<(), Errno> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fork(&self) -> Result<Arc<dyn MemoryManager>, Errno> {
        Ok(FakeMemoryManager::new(NEXT_FORKED_MM.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Loads any absolute path except the ones marked missing
#[derive(Default)]
pub struct FakeLoader {
    next_mm: AtomicU64,
    missing: Mutex<BTreeSet<String>>,
    loads: Mutex<Vec<LoadArgs>>,
    restored: Mutex<Vec<u64>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            next_mm: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn set_missing(&self, filename: impl Into<String>) {
        self.missing.lock().insert(filename.into());
    }

    pub fn loads(&self) -> Vec<LoadArgs> {
        self.loads.lock().clone()
    }

    /// IDs of the memory managers rebuilt by restores
    pub fn restored(&self) -> Vec<u64> {
        self.restored.lock().clone()
    }
}

impl Loader for FakeLoader {
    fn load_task_image(&self, args: &LoadArgs) -> Result<TaskImage, LoadError> {
        if self.missing.lock().contains(&args.filename) {
            return Err(LoadError::new(args.filename.clone(), Errno::ENOENT));
        }
        self.loads.lock().push(args.clone());
        let name = args
            .filename
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(TaskImage {
            name,
            arch: ArchState::default(),
            memory_manager: FakeMemoryManager::new(self.next_mm.fetch_add(1, Ordering::SeqCst)),
            file_caps: None,
        })
    }

    fn restore_memory_manager(&self, id: u64) -> Result<Arc<dyn MemoryManager>, LoadError> {
        self.restored.lock().push(id);
        Ok(FakeMemoryManager::new(id))
    }
}

/// A memory file holding an arbitrary byte payload
///
/// Saved as a name header and a length-prefixed payload; the payload goes
/// to the pages stream when there is one.
pub struct FakeMemoryFile {
    name: String,
    contents: Mutex<Vec<u8>>,
    faults: Arc<FaultInjector>,
    evictions: AtomicUsize,
    savable: AtomicUsize,
    saves: AtomicUsize,
    loads: AtomicUsize,
    destroyed: AtomicUsize,
}

impl FakeMemoryFile {
    pub fn new(name: impl Into<String>, faults: Arc<FaultInjector>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            contents: Mutex::new(Vec::new()),
            faults,
            evictions: AtomicUsize::new(0),
            savable: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        })
    }

    pub fn set_contents(&self, contents: impl Into<Vec<u8>>) {
        *self.contents.lock() = contents.into();
    }

    pub fn contents(&self) -> Vec<u8> {
        self.contents.lock().clone()
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }

    pub fn savable_marks(&self) -> usize {
        self.savable.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl MemoryFile for FakeMemoryFile {
    fn start_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }

    fn wait_for_evictions(&self) {}

    fn mark_savable(&self) {
        self.savable.fetch_add(1, Ordering::SeqCst);
    }

    fn save_to(
        &self,
        metadata: &mut dyn Write,
        pages: Option<&mut dyn Write>,
        _opts: &MemorySaveOpts,
    ) -> io::Result<()> {
        if self.faults.should_fail_save() {
            return Err(io::Error::new(io::ErrorKind::Other, "injected save failure"));
        }
        let contents = self.contents.lock().clone();
        metadata.write_all(&(self.name.len() as u64).to_le_bytes())?;
        metadata.write_all(self.name.as_bytes())?;
        metadata.write_all(&(contents.len() as u64).to_le_bytes())?;
        match pages {
            Some(pages) => pages.write_all(&contents)?,
            None => metadata.write_all(&contents)?,
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_from(&self, metadata: &mut dyn Read, pages: Option<&mut dyn Read>) -> io::Result<()> {
        if self.faults.should_fail_load() {
            return Err(io::Error::new(io::ErrorKind::Other, "injected load failure"));
        }
        let name_len = read_u64(metadata)? as usize;
        let mut name = vec![0u8; name_len];
        metadata.read_exact(&mut name)?;
        if name != self.name.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "memory file {:?} found in place of {:?}",
                    String::from_utf8_lossy(&name),
                    self.name
                ),
            ));
        }
        let len = read_u64(metadata)? as usize;
        let mut contents = vec![0u8; len];
        match pages {
            Some(pages) => pages.read_exact(&mut contents)?,
            None => metadata.read_exact(&mut contents)?,
        }
        *self.contents.lock() = contents;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct FakeFile {
    id: FileId,
    name: String,
    socket: bool,
    timer_pauses: AtomicUsize,
    timer_resumes: AtomicUsize,
}

impl FakeFile {
    pub fn new(id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: FileId(id),
            name: name.to_string(),
            socket: false,
            timer_pauses: AtomicUsize::new(0),
            timer_resumes: AtomicUsize::new(0),
        })
    }

    pub fn socket(id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: FileId(id),
            name: name.to_string(),
            socket: true,
            timer_pauses: AtomicUsize::new(0),
            timer_resumes: AtomicUsize::new(0),
        })
    }

    pub fn timer_pauses(&self) -> usize {
        self.timer_pauses.load(Ordering::SeqCst)
    }

    pub fn timer_resumes(&self) -> usize {
        self.timer_resumes.load(Ordering::SeqCst)
    }
}

impl FileDescription for FakeFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn mapped_name(&self) -> String {
        self.name.clone()
    }

    fn is_socket(&self) -> bool {
        self.socket
    }

    fn pause_timer(&self) {
        self.timer_pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_timer(&self) {
        self.timer_resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resolves every path lexically
#[derive(Default)]
pub struct FakeVfs {
    next_mount: AtomicU64,
    missing: Mutex<BTreeSet<String>>,
    private: Mutex<BTreeMap<String, Arc<dyn MemoryFile>>>,
    restores: Mutex<Vec<CompleteRestoreOptions>>,
    restored_files: Mutex<Vec<FileId>>,
    inits: AtomicUsize,
    before_resumes: AtomicUsize,
    releases: AtomicUsize,
}

impl FakeVfs {
    pub fn new() -> Self {
        Self {
            next_mount: AtomicU64::new(100),
            ..Default::default()
        }
    }

    pub fn set_missing(&self, path: impl Into<String>) {
        self.missing.lock().insert(path.into());
    }

    /// Registers a memory file reported by every later save
    pub fn add_private_memory_file(&self, owner: impl Into<String>, mf: Arc<dyn MemoryFile>) {
        self.private.lock().insert(owner.into(), mf);
    }

    pub fn complete_restores(&self) -> Vec<CompleteRestoreOptions> {
        self.restores.lock().clone()
    }

    pub fn restored_files(&self) -> Vec<FileId> {
        self.restored_files.lock().clone()
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn before_resumes(&self) -> usize {
        self.before_resumes.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl VirtualFilesystem for FakeVfs {
    fn init(&self) -> Result<(), KernelError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn new_disconnected_mount(&self, fs: SpecialFilesystem) -> Result<VirtualDentry, KernelError> {
        let mount = self.next_mount.fetch_add(1, Ordering::SeqCst);
        Ok(VirtualDentry::new(mount, format!("{:?}:/", fs)))
    }

    fn get_dentry_at(
        &self,
        _creds: &Credentials,
        root: &VirtualDentry,
        start: &VirtualDentry,
        path: &str,
    ) -> Result<VirtualDentry, Errno> {
        let resolved = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", start.path.trim_end_matches('/'), path)
        };
        if self.missing.lock().contains(&resolved) {
            return Err(Errno::ENOENT);
        }
        Ok(VirtualDentry::new(root.mount, resolved))
    }

    fn prepare_save(
        &self,
        private_memory_files: &mut BTreeMap<String, Arc<dyn MemoryFile>>,
    ) -> Result<(), KernelError> {
        for (owner, mf) in self.private.lock().iter() {
            private_memory_files.insert(owner.clone(), Arc::clone(mf));
        }
        Ok(())
    }

    fn complete_restore(&self, opts: &CompleteRestoreOptions) -> Result<(), KernelError> {
        self.restores.lock().push(*opts);
        Ok(())
    }

    fn before_resume(&self) {
        self.before_resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn restore_file(&self, id: FileId) -> Result<Arc<dyn FileDescription>, KernelError> {
        self.restored_files.lock().push(id);
        Ok(FakeFile::new(id.0, &format!("restored-{}", id.0)))
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct FakeNetworkStack {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    restores: AtomicUsize,
    config_replacements: AtomicUsize,
    destroyed: AtomicUsize,
}

impl FakeNetworkStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn config_replacements(&self) -> usize {
        self.config_replacements.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl NetworkStack for FakeNetworkStack {
    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn restore(&self) {
        self.restores.fetch_add(1, Ordering::SeqCst);
    }

    fn replace_config(&self, _new: Arc<dyn NetworkStack>) {
        self.config_replacements.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Clocks that only move when told to
#[derive(Debug)]
pub struct ManualClocks {
    realtime: AtomicI64,
    monotonic: AtomicI64,
}

impl ManualClocks {
    pub fn new(start_ns: i64) -> Arc<Self> {
        Arc::new(Self {
            realtime: AtomicI64::new(start_ns),
            monotonic: AtomicI64::new(start_ns),
        })
    }

    pub fn advance(&self, ns: i64) {
        self.realtime.fetch_add(ns, Ordering::SeqCst);
        self.monotonic.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clocks for ManualClocks {
    fn realtime_now(&self) -> i64 {
        self.realtime.load(Ordering::SeqCst)
    }

    fn monotonic_now(&self) -> i64 {
        self.monotonic.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct FakeAsyncLoader {
    waits: AtomicUsize,
}

impl FakeAsyncLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

impl AsyncMemoryFileLoader for FakeAsyncLoader {
    fn wait_main_start(&self) -> io::Result<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One of each fake, sharing a fault injector
pub struct Fakes {
    pub platform: Arc<ScriptedPlatform>,
    pub loader: Arc<FakeLoader>,
    pub vfs: Arc<FakeVfs>,
    pub memory_file: Arc<FakeMemoryFile>,
    pub faults: Arc<FaultInjector>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_faults(FaultPlan::new())
    }

    pub fn with_faults(plan: FaultPlan) -> Self {
        let faults = FaultInjector::new(plan);
        Self {
            platform: Arc::new(ScriptedPlatform::new(Arc::clone(&faults))),
            loader: Arc::new(FakeLoader::new()),
            vfs: Arc::new(FakeVfs::new()),
            memory_file: FakeMemoryFile::new("main", Arc::clone(&faults)),
            faults,
        }
    }

    pub fn deps(&self) -> KernelDeps {
        KernelDeps {
            platform: self.platform.clone(),
            loader: self.loader.clone(),
            vfs: self.vfs.clone(),
            memory_file: self.memory_file.clone(),
        }
    }

    /// Init arguments with a fresh root user namespace and `clocks`
    pub fn init_args(&self, cores: u32, clocks: Arc<dyn Clocks>) -> InitKernelArgs {
        InitKernelArgs::new(cores)
            .with_feature_set(test_feature_set())
            .with_clocks(clocks)
            .with_root_user_namespace(UserNamespace::new_root())
    }

    /// A kernel with two application cores and manual clocks
    pub fn kernel(&self) -> Result<Arc<Kernel>, KernelError> {
        Kernel::init(self.init_args(2, ManualClocks::new(1_000_000)), self.deps())
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for a root process running `argv`, in the test mount
/// namespace
pub fn process_args(kernel: &Kernel, argv: &[&str]) -> CreateProcessArgs {
    let creds = Arc::new(Credentials::new_root(Arc::clone(kernel.root_user_namespace())));
    CreateProcessArgs::new(argv.iter().map(|s| s.to_string()).collect(), creds)
        .with_mount_namespace(test_mount_namespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_memory_file_round_trip_with_pages() {
        let faults = FaultInjector::none();
        let saved = FakeMemoryFile::new("main", Arc::clone(&faults));
        saved.set_contents(b"pages".to_vec());
        let (mut meta, mut pages) = (Vec::new(), Vec::new());
        saved
            .save_to(&mut meta, Some(&mut pages), &MemorySaveOpts::default())
            .unwrap();
        assert_eq!(pages, b"pages");

        let loaded = FakeMemoryFile::new("main", faults);
        loaded
            .load_from(&mut Cursor::new(meta), Some(&mut Cursor::new(pages)))
            .unwrap();
        assert_eq!(loaded.contents(), b"pages");
    }

    #[test]
    fn test_memory_file_rejects_other_name() {
        let faults = FaultInjector::none();
        let saved = FakeMemoryFile::new("a", Arc::clone(&faults));
        let mut meta = Vec::new();
        saved.save_to(&mut meta, None, &MemorySaveOpts::default()).unwrap();
        let other = FakeMemoryFile::new("b", faults);
        let err = other.load_from(&mut Cursor::new(meta), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_platform_runs_default_script_then_blocks() {
        let platform = ScriptedPlatform::new(FaultInjector::none());
        platform.set_default_script(vec![AppEvent::Continue, AppEvent::ExitGroup(3)]);
        let mm = FakeMemoryManager::new(1);
        let mut arch = ArchState::default();
        let mut run = |platform: &ScriptedPlatform| {
            platform.switch_to_app(AppContext {
                task: TaskKey(9),
                tid: core_types::ThreadId(1),
                arch: &mut arch,
                memory_manager: &*mm,
            })
        };
        assert_eq!(run(&platform), AppEvent::Continue);
        assert_eq!(run(&platform), AppEvent::ExitGroup(3));
        assert_eq!(run(&platform), AppEvent::Block(None));
        assert_eq!(platform.switches(), 3);
    }

    #[test]
    fn test_vfs_resolves_relative_paths() {
        let vfs = FakeVfs::new();
        let creds = Credentials::new_root(UserNamespace::new_root());
        let root = VirtualDentry::new(1, "/");
        let start = VirtualDentry::new(1, "/home");
        let d = vfs.get_dentry_at(&creds, &root, &start, "user").unwrap();
        assert_eq!(d, VirtualDentry::new(1, "/home/user"));
        vfs.set_missing("/nope");
        assert_eq!(
            vfs.get_dentry_at(&creds, &root, &root, "/nope"),
            Err(Errno::ENOENT)
        );
    }
}
