/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::prelude::*;
use rusty_ulid::Ulid;
use slog::{info, warn, Logger};

use crate::error::{illegal_state, resource_error, RResult};

/**
 * The host directory in which one job stages its inputs and leaves its
 * outputs.  The directory is named for the job, so that no two jobs ever
 * share one.
 */
pub struct WorkDir {
    log: Logger,
    id: String,
    path: PathBuf,
    created: Mutex<Option<DateTime<Utc>>>,
    removed: AtomicBool,
}

/**
 * A job ID names a single directory beneath the work root, so it must be one
 * plain path component.
 */
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
}

impl WorkDir {
    /**
     * Describe a work directory beneath "base".  If no job ID is provided, a
     * fresh ULID is used.  Nothing is created on disk until create().
     */
    pub fn new(log: &Logger, base: &Path, id: Option<&str>) -> WorkDir {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Ulid::generate().to_string().to_lowercase());
        let path = base.join(&id);

        WorkDir {
            log: log.new(slog::o!("workdir" => path.display().to_string())),
            id,
            path,
            created: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /**
     * The leaf name of the directory, used as the sub-path when the
     * directory is reached through a shared volume.
     */
    pub fn leaf(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        *self.created.lock().unwrap()
    }

    /**
     * Create the directory.  It must not already exist, and it is made
     * writable by every user as the job may not run with our UID.
     */
    pub fn create(&self) -> RResult<()> {
        if self.created().is_some() {
            illegal_state!("work directory {:?} already created", self.path);
        }
        if !valid_id(&self.id) {
            illegal_state!("invalid job ID {:?}", self.id);
        }

        if self.path.exists() {
            resource_error!(
                "work directory {:?} already exists",
                self.path
            );
        }

        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                resource_error!("creating {:?}: {e}", parent);
            }
        }

        if let Err(e) = std::fs::create_dir(&self.path) {
            resource_error!("creating work directory {:?}: {e}", self.path);
        }

        let perms = std::fs::Permissions::from_mode(0o777);
        if let Err(e) = std::fs::set_permissions(&self.path, perms) {
            resource_error!(
                "making work directory {:?} writable: {e}",
                self.path
            );
        }

        *self.created.lock().unwrap() = Some(Utc::now());
        info!(self.log, "created work directory");
        Ok(())
    }

    /**
     * Resolve a file name within the directory, refusing anything that would
     * escape it.
     */
    pub fn file(&self, name: &str) -> RResult<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty()
            || !rel.components().all(|c| matches!(c, Component::Normal(_)))
        {
            illegal_state!("invalid work directory file name {name:?}");
        }

        Ok(self.path.join(rel))
    }

    fn check_live(&self) -> RResult<()> {
        if self.created().is_none() {
            illegal_state!("work directory {:?} not yet created", self.path);
        }
        if self.removed.load(Ordering::SeqCst) {
            illegal_state!("work directory {:?} has been removed", self.path);
        }
        Ok(())
    }

    /**
     * Copy the contents of a reader into the named file, replacing any
     * existing file.  The reader is consumed whether or not the copy
     * succeeds.  Returns the number of bytes written.
     */
    pub fn write_input<R: Read>(
        &self,
        name: &str,
        mut content: R,
        executable: bool,
    ) -> RResult<u64> {
        self.check_live()?;
        let p = self.file(name)?;

        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut f = File::create(&p)?;
        let sz = std::io::copy(&mut content, &mut f)?;

        if executable {
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(&p, perms)?;
        }

        Ok(sz)
    }

    pub fn write_input_str(
        &self,
        name: &str,
        content: &str,
        executable: bool,
    ) -> RResult<u64> {
        self.write_input(name, content.as_bytes(), executable)
    }

    /**
     * Open a named output file.  A file that does not exist is not an error;
     * the job may simply not have produced it.
     */
    pub fn read_output(&self, name: &str) -> RResult<Option<File>> {
        self.check_live()?;
        let p = self.file(name)?;

        match File::open(&p) {
            Ok(f) => {
                if f.metadata()?.is_dir() {
                    return Ok(None);
                }
                Ok(Some(f))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn file_as_properties(
        &self,
        name: &str,
    ) -> RResult<Option<BTreeMap<String, String>>> {
        let Some(mut f) = self.read_output(name)? else {
            return Ok(None);
        };

        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        Ok(Some(crate::props::parse(&buf)))
    }

    /**
     * Remove the directory and everything in it.  Only the first call does
     * anything; a directory that has already vanished is not an error.
     * Returns true if this call performed the removal.
     */
    pub fn remove(&self) -> bool {
        if self.removed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if self.created().is_none() {
            /*
             * We never created the directory, so there is nothing of ours to
             * remove.
             */
            return true;
        }

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!(self.log, "removed work directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(self.log, "work directory already gone");
            }
            Err(e) => warn!(self.log, "could not remove work directory: {e}"),
        }
        true
    }
}
