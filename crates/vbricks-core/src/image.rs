//! Disk images shared by virtual machines.

use crate::config::{split_assignment, LineCursor};
use crate::error::{CoreError, Result};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

/// A registered disk image.
///
/// Any number of VMs may use an image through a private copy-on-write
/// overlay, but at most one may write to it directly. That VM holds the
/// master lock while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskImage {
    pub name: String,
    pub path: PathBuf,
    /// Remote host the image lives on.
    pub host: Option<String>,
    pub readonly: bool,
    /// VMs bound to this image.
    pub users: BTreeSet<String>,
    /// VM writing to the image directly.
    pub master: Option<String>,
}

impl DiskImage {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            host: None,
            readonly: false,
            users: BTreeSet::new(),
            master: None,
        }
    }

    /// Take the master lock for `vm`.
    ///
    /// # Errors
    ///
    /// [`CoreError::LockedImage`] if the image is read-only,
    /// [`CoreError::DiskLocked`] if another VM holds the lock.
    pub fn acquire_master(&mut self, vm: &str) -> Result<()> {
        if self.readonly {
            return Err(CoreError::LockedImage(self.name.clone()));
        }
        match &self.master {
            Some(holder) if holder != vm => Err(CoreError::DiskLocked {
                image: self.name.clone(),
                holder: holder.clone(),
            }),
            _ => {
                self.master = Some(vm.to_string());
                tracing::debug!(image = %self.name, vm, "Master lock taken");
                Ok(())
            }
        }
    }

    /// Release the master lock if `vm` holds it.
    pub fn release_master(&mut self, vm: &str) {
        if self.master.as_deref() == Some(vm) {
            self.master = None;
            tracing::debug!(image = %self.name, vm, "Master lock released");
        }
    }

    pub fn in_use(&self) -> bool {
        !self.users.is_empty()
    }

    /// Append a `[DiskImage:<name>]` section.
    pub fn save_to(&self, out: &mut String) {
        let _ = writeln!(out, "[DiskImage:{}]", self.name);
        let _ = writeln!(out, "path={}", self.path.display());
        if let Some(host) = &self.host {
            let _ = writeln!(out, "host={host}");
        }
        if self.readonly {
            let _ = writeln!(out, "readonly=True");
        }
        out.push('\n');
    }

    /// Read the body of a `[DiskImage:<name>]` section.
    pub fn load_from(name: &str, cursor: &mut LineCursor) -> Result<Self> {
        let mut image = DiskImage::new(name, PathBuf::new());
        while let Some(line) = cursor.peek() {
            if line.trim().is_empty() {
                cursor.next_line();
                break;
            }
            let Some((key, value)) = split_assignment(line) else {
                break;
            };
            match key {
                "path" => image.path = PathBuf::from(value.trim()),
                "host" => image.host = Some(value.trim().to_string()),
                "readonly" => image.readonly = value.trim().eq_ignore_ascii_case("true"),
                other => {
                    tracing::warn!(image = %name, key = other, "Ignoring unknown disk image key")
                }
            }
            cursor.next_line();
        }
        if image.path.as_os_str().is_empty() {
            return Err(CoreError::Parse {
                line: cursor.line_no(),
                reason: format!("disk image {name} has no path"),
            });
        }
        Ok(image)
    }
}
