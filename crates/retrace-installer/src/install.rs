use anyhow::{anyhow, Context, Result};
use retrace_core::{validated_relative_payload_path, PayloadEntry, SetupData};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::journal::{JournalEntry, JournalWriter};
use crate::layout::{uninstall_command, InstallLayout};
use crate::registry::{join_key, key_segments, RegistryStore, UNINSTALL_KEY};
use crate::scope::{resolve_scope, InstallScope, RuntimeRegistration};
use crate::types::{InstallResult, KeyDisposition, MutationFailure};

#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    pub setup: &'a SetupData,
    pub target_dir: PathBuf,
    pub source: PathBuf,
    pub uninstaller_stub: Option<&'a [u8]>,
    pub registration: RuntimeRegistration,
    pub registry_root: Option<PathBuf>,
}

pub struct InstallSession<'a> {
    layout: InstallLayout,
    scope: InstallScope,
    journal: JournalWriter,
    store: &'a dyn RegistryStore,
    created_files: Vec<PathBuf>,
    overwritten_files: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
    registry_entries: usize,
    failures: Vec<MutationFailure>,
}

pub fn install<I, F>(
    request: &InstallRequest<'_>,
    store: &dyn RegistryStore,
    payload: I,
    on_progress: F,
) -> Result<InstallResult>
where
    I: IntoIterator<Item = Result<PayloadEntry>>,
    F: FnMut(&Path),
{
    let target_dir = absolute_target_dir(&request.target_dir)?;
    let source = std::path::absolute(&request.source).unwrap_or_else(|_| request.source.clone());

    let decision = resolve_scope(request.registration, store);
    let mut warnings = Vec::new();
    warnings.extend(decision.warning);

    let layout = InstallLayout::new(&target_dir, &request.setup.metadata.name);
    let mut session = InstallSession::begin(layout, decision.scope, store, &source)?;
    info!(
        package = %request.setup.title(),
        hive = session.scope.hive_name(),
        target = %target_dir.display(),
        "installing"
    );

    session.extract(payload, on_progress)?;
    let uninstaller_path = session.write_uninstaller(request.uninstaller_stub);
    let command_exe = uninstaller_path.as_deref().unwrap_or(&source);
    let command = uninstall_command(
        command_exe,
        session.journal.path(),
        request.registry_root.as_deref(),
    );
    session.register(request.setup, &command)?;

    session.finish(request.setup, uninstaller_path, command, warnings)
}

impl<'a> InstallSession<'a> {
    pub fn begin(
        layout: InstallLayout,
        scope: InstallScope,
        store: &'a dyn RegistryStore,
        source: &Path,
    ) -> Result<Self> {
        let mut journal = JournalWriter::open(&layout.journal_path(), source)?;
        journal.record(&JournalEntry::ScopeMarker(scope))?;
        Ok(Self {
            layout,
            scope,
            journal,
            store,
            created_files: Vec::new(),
            overwritten_files: Vec::new(),
            created_dirs: Vec::new(),
            registry_entries: 0,
            failures: Vec::new(),
        })
    }

    pub fn scope(&self) -> InstallScope {
        self.scope
    }

    fn fail(&mut self, action: &str, target: impl Into<String>, err: anyhow::Error) {
        let failure = MutationFailure::new(action, target, &err);
        warn!(action, target = %failure.target, error = %failure.message, "install step failed");
        self.failures.push(failure);
    }

    pub fn extract<I, F>(&mut self, payload: I, mut on_progress: F) -> Result<()>
    where
        I: IntoIterator<Item = Result<PayloadEntry>>,
        F: FnMut(&Path),
    {
        for item in payload {
            match item {
                Ok(entry) => {
                    if self.extract_entry(&entry)? {
                        on_progress(&entry.rel_path);
                    }
                }
                Err(err) => self.fail("extract", "payload archive", err),
            }
        }
        Ok(())
    }

    fn extract_entry(&mut self, entry: &PayloadEntry) -> Result<bool> {
        let raw = entry.rel_path.to_string_lossy();
        if let Err(err) = validated_relative_payload_path(&raw) {
            self.fail("extract", raw.into_owned(), err);
            return Ok(false);
        }

        let dest = self.layout.payload_path(&entry.rel_path);
        if let Some(parent) = dest.parent() {
            if !self.ensure_parent_dirs(parent)? {
                return Ok(false);
            }
        }

        let existed = fs::symlink_metadata(&dest).is_ok();
        if dest.is_dir() {
            self.fail(
                "write file",
                dest.display().to_string(),
                anyhow!("a directory already occupies this path"),
            );
            return Ok(false);
        }

        match fs::write(&dest, &entry.contents) {
            Ok(()) => {
                if existed {
                    self.journal
                        .record(&JournalEntry::FileOverwritten(dest.clone()))?;
                    debug!(path = %dest.display(), "overwrote file");
                    self.overwritten_files.push(dest);
                } else {
                    self.journal.record(&JournalEntry::FileCreated(dest.clone()))?;
                    debug!(path = %dest.display(), "created file");
                    self.created_files.push(dest);
                }
                Ok(true)
            }
            Err(err) => {
                if !existed && fs::symlink_metadata(&dest).is_ok() {
                    self.journal.record(&JournalEntry::FileCreated(dest.clone()))?;
                    self.created_files.push(dest.clone());
                }
                let err = anyhow::Error::new(err)
                    .context(format!("failed to write file: {}", dest.display()));
                self.fail("write file", dest.display().to_string(), err);
                Ok(false)
            }
        }
    }

    fn ensure_parent_dirs(&mut self, parent: &Path) -> Result<bool> {
        let target_dir = self.layout.target_dir().to_path_buf();
        let mut missing = parent
            .ancestors()
            .take_while(|dir| *dir != target_dir.as_path() && !dir.is_dir())
            .map(Path::to_path_buf)
            .collect::<Vec<_>>();
        missing.reverse();

        for dir in missing {
            match fs::create_dir(&dir) {
                Ok(()) => {
                    self.journal
                        .record(&JournalEntry::DirectoryCreated(dir.clone()))?;
                    debug!(path = %dir.display(), "created directory");
                    self.created_dirs.push(dir);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists && dir.is_dir() => {}
                Err(err) => {
                    let err = anyhow::Error::new(err)
                        .context(format!("failed to create directory: {}", dir.display()));
                    self.fail("create directory", dir.display().to_string(), err);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    pub fn write_uninstaller(&mut self, stub: Option<&[u8]>) -> Option<PathBuf> {
        let stub = stub?;
        let path = self.layout.uninstaller_path();
        match write_executable(&path, stub) {
            Ok(()) => {
                debug!(path = %path.display(), "wrote uninstaller");
                Some(path)
            }
            Err(err) => {
                self.fail("write uninstaller", path.display().to_string(), err);
                None
            }
        }
    }

    pub fn register(&mut self, setup: &SetupData, uninstall_command: &str) -> Result<()> {
        let key = join_key(UNINSTALL_KEY, &setup.uninstall_subkey_name());
        if !self.create_key_chain(&key)? {
            return Ok(());
        }

        let mut values = vec![
            ("DisplayName", setup.display_name()),
            ("DisplayVersion", setup.metadata.version.clone()),
        ];
        if let Some(author) = &setup.metadata.author {
            values.push(("Publisher", author.clone()));
        }
        values.push(("InstallScope", self.scope.hive_name().to_string()));
        values.push(("UninstallString", uninstall_command.to_string()));

        for (name, data) in values {
            match self.store.set_value(self.scope, &key, name, &data) {
                Ok(()) => {
                    self.journal.record(&JournalEntry::RegistryValueSet {
                        key: key.clone(),
                        name: name.to_string(),
                        data,
                    })?;
                    self.registry_entries += 1;
                }
                Err(err) => {
                    let target = format!("{}\\{key}\\{name}", self.scope.hive_name());
                    self.fail("set registry value", target, err);
                }
            }
        }
        Ok(())
    }

    fn create_key_chain(&mut self, key: &str) -> Result<bool> {
        let segments = key_segments(key)?
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut parent = String::new();
        for segment in segments {
            let full = join_key(&parent, &segment);
            match self.store.create_key(self.scope, &full) {
                Ok(KeyDisposition::Created) => {
                    self.journal.record(&JournalEntry::RegistryKeyCreated {
                        parent: parent.clone(),
                        subkey: segment,
                    })?;
                    debug!(hive = self.scope.hive_name(), key = %full, "created registry key");
                    self.registry_entries += 1;
                }
                Ok(KeyDisposition::Existing) => {}
                Err(err) => {
                    let target = format!("{}\\{full}", self.scope.hive_name());
                    self.fail("create registry key", target, err);
                    return Ok(false);
                }
            }
            parent = full;
        }
        Ok(true)
    }

    pub fn finish(
        self,
        setup: &SetupData,
        uninstaller_path: Option<PathBuf>,
        uninstall_command: String,
        warnings: Vec<String>,
    ) -> Result<InstallResult> {
        let journal_path = self.journal.finish()?;
        Ok(InstallResult {
            package: setup.title(),
            scope: self.scope,
            target_dir: self.layout.target_dir().to_path_buf(),
            journal_path,
            uninstaller_path,
            uninstall_command,
            created_files: self.created_files,
            overwritten_files: self.overwritten_files,
            created_dirs: self.created_dirs,
            registry_entries: self.registry_entries,
            failures: self.failures,
            warnings,
        })
    }
}

fn absolute_target_dir(target_dir: &Path) -> Result<PathBuf> {
    if !target_dir.is_dir() {
        return Err(anyhow!(
            "install target directory does not exist: {}",
            target_dir.display()
        ));
    }
    #[cfg(windows)]
    let resolved = std::path::absolute(target_dir);
    #[cfg(not(windows))]
    let resolved = fs::canonicalize(target_dir);
    let absolute = resolved.with_context(|| {
        format!(
            "failed to resolve install target directory: {}",
            target_dir.display()
        )
    })?;
    match absolute.to_str() {
        Some(text) if !text.chars().any(char::is_control) => Ok(absolute),
        _ => Err(anyhow!(
            "install target directory cannot be journaled verbatim: {}",
            absolute.display()
        )),
    }
}

fn write_executable(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)
        .with_context(|| format!("failed to write uninstaller: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)
            .with_context(|| format!("failed to inspect uninstaller: {}", path.display()))?
            .permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(path, permissions).with_context(|| {
            format!("failed setting uninstaller permissions: {}", path.display())
        })?;
    }
    Ok(())
}
