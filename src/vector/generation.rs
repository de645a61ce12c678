//! Atomic, crash-safe publishing of index generations.
//!
//! Some filesystems (network volumes, certain platforms) refuse to
//! rename or unlink a file while another handle is open, and
//! occasionally refuse writes to otherwise-valid absolute paths under
//! load. Generations sidestep both: every publish writes a fresh
//! immutable file and then swings the `CURRENT` pointer, so the reader
//! path never observes a partially-written index.
//!
//! Layout under `base/`:
//!
//! ```text
//! CURRENT                      # content: active generation filename
//! <stem>-<ts>-<pid>-<rnd>.idx  # one per generation, immutable once linked
//! <stem>.lock                  # advisory write lock
//! ```

use crate::config;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Process-wide lock around working-directory manipulation. The chdir
/// publish strategy treats the CWD as a coarse lock; everything that
/// touches it must hold this.
static CWD_LOCK: Mutex<()> = Mutex::new(());

/// Manages generation files and the `CURRENT` pointer under one base
/// directory.
#[derive(Debug)]
pub struct GenerationManager {
    base: PathBuf,
    stem: String,
}

/// Advisory write-lock guard; the lock file is removed on drop.
pub struct WriteLockGuard {
    path: PathBuf,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release write lock");
        }
    }
}

/// Restores the original working directory on every exit path.
struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    fn enter(target: &Path) -> std::io::Result<Self> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(target)?;
        Ok(Self { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.original) {
            tracing::error!(
                path = %self.original.display(),
                error = %e,
                "failed to restore working directory"
            );
        }
    }
}

impl GenerationManager {
    /// Create a manager over `base`, creating the directory if needed.
    pub fn new(base: impl Into<PathBuf>, stem: impl Into<String>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            stem: stem.into(),
        })
    }

    /// The managed base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Acquire the advisory write lock, failing fast with
    /// [`Error::LockHeld`] when another process holds it.
    pub fn acquire_lock(&self) -> Result<WriteLockGuard> {
        let path = self.base.join(format!("{}.lock", self.stem));
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(WriteLockGuard { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::LockHeld(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate a fresh generation filename.
    fn next_generation_name(&self) -> Result<String> {
        let ts = crate::vector::sidecar::now_epoch_seconds()?;
        let pid = std::process::id();
        let rnd: u32 = rand::thread_rng().gen();
        Ok(format!("{}-{ts}-{pid}-{rnd:08x}.idx", self.stem))
    }

    /// Publish a new generation written by `write_fn` and swing `CURRENT`
    /// to it. Returns the path of the published generation.
    ///
    /// Strategies are attempted in order until one produces a non-empty
    /// file: direct write into the base directory; chdir into the base
    /// and write by bare filename; write in the current directory and
    /// move the result into place. When all three fail, `CURRENT` is left
    /// untouched and [`Error::PersistenceFailed`] is returned, so readers
    /// keep the previous generation.
    pub fn publish(&self, write_fn: &mut dyn FnMut(&Path) -> Result<()>) -> Result<PathBuf> {
        let name = self.next_generation_name()?;
        let target = self.base.join(&name);
        let mut failures: Vec<String> = Vec::new();

        let written = self.try_direct_write(&target, write_fn, &mut failures)
            || self.try_chdir_write(&name, write_fn, &mut failures)
            || self.try_local_move(&name, &target, write_fn, &mut failures);

        if !written || !file_non_empty(&target) {
            return Err(Error::PersistenceFailed(format!(
                "all publish strategies failed for {name}: [{}]",
                failures.join("; ")
            )));
        }

        self.update_current(&name)?;
        self.retain_recent(config::GENERATION_RETAIN_COUNT, &name);
        tracing::info!(generation = %name, "published index generation");
        Ok(target)
    }

    fn try_direct_write(
        &self,
        target: &Path,
        write_fn: &mut dyn FnMut(&Path) -> Result<()>,
        failures: &mut Vec<String>,
    ) -> bool {
        match write_fn(target) {
            Ok(()) => true,
            Err(e) => {
                failures.push(format!("direct: {e}"));
                remove_partial(target);
                false
            }
        }
    }

    fn try_chdir_write(
        &self,
        name: &str,
        write_fn: &mut dyn FnMut(&Path) -> Result<()>,
        failures: &mut Vec<String>,
    ) -> bool {
        let _cwd_lock = CWD_LOCK.lock();
        let guard = match CwdGuard::enter(&self.base) {
            Ok(g) => g,
            Err(e) => {
                failures.push(format!("chdir: {e}"));
                return false;
            }
        };
        let result = write_fn(Path::new(name));
        drop(guard);
        match result {
            Ok(()) => true,
            Err(e) => {
                failures.push(format!("chdir: {e}"));
                remove_partial(&self.base.join(name));
                false
            }
        }
    }

    fn try_local_move(
        &self,
        name: &str,
        target: &Path,
        write_fn: &mut dyn FnMut(&Path) -> Result<()>,
        failures: &mut Vec<String>,
    ) -> bool {
        let _cwd_lock = CWD_LOCK.lock();
        let local = PathBuf::from(name);
        if let Err(e) = write_fn(&local) {
            failures.push(format!("local: {e}"));
            remove_partial(&local);
            return false;
        }
        match move_file(&local, target) {
            Ok(()) => true,
            Err(e) => {
                failures.push(format!("move: {e}"));
                remove_partial(&local);
                remove_partial(target);
                false
            }
        }
    }

    /// Atomically point `CURRENT` at `name`: write a temp file, fsync
    /// best-effort, rename over the old pointer.
    fn update_current(&self, name: &str) -> Result<()> {
        let current = self.base.join("CURRENT");
        let tmp = self.base.join("CURRENT.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(name.as_bytes())?;
            file.write_all(b"\n")?;
            if let Err(e) = file.sync_all() {
                if e.kind() != std::io::ErrorKind::PermissionDenied {
                    return Err(e.into());
                }
                tracing::warn!(error = %e, "fsync on CURRENT denied (ignored)");
            }
        }
        fs::rename(&tmp, &current)?;
        // Directory fsync so the rename itself is durable where supported.
        if let Ok(dir) = fs::File::open(&self.base) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Resolve the active generation path, or `None` when no generation
    /// has been published or the pointed-at file is gone.
    pub fn resolve_current(&self) -> Option<PathBuf> {
        let content = fs::read_to_string(self.base.join("CURRENT")).ok()?;
        let name = content.trim();
        if name.is_empty() {
            return None;
        }
        let path = self.base.join(name);
        path.exists().then_some(path)
    }

    /// Delete all but the `keep` most recent generation files, always
    /// sparing `just_published`. Transient permission failures skip the
    /// victim and move on.
    fn retain_recent(&self, keep: usize, just_published: &str) {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return;
        };
        let prefix = format!("{}-", self.stem);
        let mut generations: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                if !name.starts_with(&prefix) || !name.ends_with(".idx") {
                    return None;
                }
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, path))
            })
            .collect();
        generations.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in generations.into_iter().skip(keep) {
            if path.file_name().and_then(|n| n.to_str()) == Some(just_published) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "pruned old generation"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to prune generation (skipped)");
                }
            }
        }
    }
}

fn file_non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn remove_partial(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}

/// Rename with copy+remove fallback for cross-device moves.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
