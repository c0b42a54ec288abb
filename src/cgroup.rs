// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cgroups-v1 devices-controller broker. Grants and
//! revokes character-device access across every container cgroup of a pod,
//! refcounted across connections that share the same device node.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

/// One parsed line of `devices.list`/`devices.allow`/`devices.deny`:
/// `<type> <major>:<minor> <modes>`, `major`/`minor` may be `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub dtype: char,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub modes: HashSet<char>,
}

impl Device {
    pub fn exact(dtype: char, major: u32, minor: u32, modes: &str) -> Device {
        Device {
            dtype,
            major: Some(major),
            minor: Some(minor),
            modes: modes.chars().collect(),
        }
    }

    fn parse(line: &str) -> Option<Device> {
        let mut fields = line.split_whitespace();
        let dtype = fields.next()?.chars().next()?;
        let numbers = fields.next()?;
        let modes = fields.next()?;

        let (major_str, minor_str) = numbers.split_once(':')?;
        let major = if major_str == "*" { None } else { Some(major_str.parse().ok()?) };
        let minor = if minor_str == "*" { None } else { Some(minor_str.parse().ok()?) };

        Some(Device { dtype, major, minor, modes: modes.chars().collect() })
    }

    fn to_line(&self) -> String {
        let major = self.major.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
        let minor = self.minor.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
        let mut modes: Vec<char> = self.modes.iter().copied().collect();
        modes.sort_unstable();
        let modes: String = modes.into_iter().collect();
        format!("{} {major}:{minor} {modes}", self.dtype)
    }

    /// Whether `self`, as an existing `devices.list` entry, already grants
    /// everything `requested` asks for: same-or-broader type, same-or-wildcard
    /// major and minor, and a mode superset. Unifies the type/major/minor
    /// special cases (type wildcard, major wildcard, mode subset) into one
    /// lattice check instead of separate branches.
    pub fn is_wider_than(&self, requested: &Device) -> bool {
        let type_wider = self.dtype == 'a' || self.dtype == requested.dtype;
        let major_wider = self.major.is_none() || self.major == requested.major;
        let minor_wider = self.minor.is_none() || self.minor == requested.minor;
        let modes_wider = self.modes.is_superset(&requested.modes);
        type_wider && major_wider && minor_wider && modes_wider
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Filesystem access to one cgroup's device-controller files, abstracted
/// for testing.
#[cfg_attr(any(test, feature = "test-mocks"), mockall::automock)]
pub trait CgroupFs: Send + Sync + fmt::Debug {
    fn expand_glob(&self, base_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>>;
    fn read_devices_list(&self, cgroup_dir: &Path) -> Result<String>;
    fn write_devices_allow(&self, cgroup_dir: &Path, line: &str) -> Result<()>;
    fn write_devices_deny(&self, cgroup_dir: &Path, line: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LinuxCgroupFs;

impl LinuxCgroupFs {
    pub fn new() -> LinuxCgroupFs {
        LinuxCgroupFs
    }
}

fn cgroup_io_error(path: &Path, detail: &str, source: std::io::Error) -> Error {
    Error::CgroupAuthorization { cgroup_path: path.to_path_buf(), detail: format!("{detail}: {source}") }
}

impl CgroupFs for LinuxCgroupFs {
    fn expand_glob(&self, base_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let full_pattern = base_dir.join(pattern);
        let full_pattern = full_pattern.to_string_lossy().into_owned();
        let mut dirs = Vec::new();
        for entry in glob::glob(&full_pattern)
            .map_err(|e| Error::Configuration { detail: format!("invalid cgroup glob '{full_pattern}': {e}") })?
        {
            let path = entry.map_err(|e| cgroup_io_error(base_dir, "glob expansion", e.into_error()))?;
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn read_devices_list(&self, cgroup_dir: &Path) -> Result<String> {
        std::fs::read_to_string(cgroup_dir.join("devices.list"))
            .map_err(|e| cgroup_io_error(cgroup_dir, "read devices.list", e))
    }

    fn write_devices_allow(&self, cgroup_dir: &Path, line: &str) -> Result<()> {
        std::fs::write(cgroup_dir.join("devices.allow"), line)
            .map_err(|e| cgroup_io_error(cgroup_dir, "write devices.allow", e))
    }

    fn write_devices_deny(&self, cgroup_dir: &Path, line: &str) -> Result<()> {
        std::fs::write(cgroup_dir.join("devices.deny"), line)
            .map_err(|e| cgroup_io_error(cgroup_dir, "write devices.deny", e))
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Serialises all devices.list/allow/deny mutations under one mutex, and
/// refcounts `(cgroup path, major, minor)` across connections sharing the
/// same device so the last releaser is the one that actually denies.
pub struct CgroupBroker {
    base_dir: PathBuf,
    fs: std::sync::Arc<dyn CgroupFs>,
    refcounts: Mutex<HashMap<(PathBuf, u32, u32), u32>>,
}

impl fmt::Debug for CgroupBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupBroker").field("base_dir", &self.base_dir).finish_non_exhaustive()
    }
}

impl CgroupBroker {
    pub fn new(base_dir: PathBuf, fs: std::sync::Arc<dyn CgroupFs>) -> CgroupBroker {
        CgroupBroker { base_dir, fs, refcounts: Mutex::new(HashMap::new()) }
    }

    fn container_dirs(&self, glob_pattern: &str) -> Result<Vec<PathBuf>> {
        self.fs.expand_glob(&self.base_dir, glob_pattern)
    }

    /// Grants `c <major>:<minor> rwm` in every container cgroup matching
    /// `glob_pattern`. Skips containers where an existing rule already
    /// widens the request. Partial failure across containers is not
    /// remediated per-container; the first error is returned after
    /// attempting the rest.
    pub fn allow(&self, glob_pattern: &str, major: u32, minor: u32) -> Result<()> {
        let requested = Device::exact('c', major, minor, "rwm");
        let dirs = self.container_dirs(glob_pattern)?;
        let mut first_error = None;

        for dir in &dirs {
            if let Err(err) = self.allow_one(dir, &requested) {
                warn!(cgroup = %dir.display(), %err, "failed to authorise device in container cgroup");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allow_one(&self, dir: &Path, requested: &Device) -> Result<()> {
        let already_wider = {
            let listing = self.fs.read_devices_list(dir)?;
            listing.lines().filter_map(Device::parse).any(|existing| existing.is_wider_than(requested))
        };
        if already_wider {
            debug!(cgroup = %dir.display(), device = %requested, "already authorised, skipping write");
            return Ok(());
        }

        let key = (dir.to_path_buf(), requested.major.unwrap(), requested.minor.unwrap());
        let mut refcounts = self.refcounts.lock().unwrap();
        let count = refcounts.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            drop(refcounts);
            self.fs.write_devices_allow(dir, &requested.to_line())?;
        }
        Ok(())
    }

    /// Revokes access previously granted by `allow` for every matching
    /// container, decrementing the refcount and only writing `devices.deny`
    /// on the 1→0 transition.
    pub fn deny(&self, glob_pattern: &str, major: u32, minor: u32) -> Result<()> {
        let requested = Device::exact('c', major, minor, "rwm");
        let dirs = self.container_dirs(glob_pattern)?;
        let mut first_error = None;

        for dir in &dirs {
            if let Err(err) = self.deny_one(dir, &requested) {
                warn!(cgroup = %dir.display(), %err, "failed to revoke device in container cgroup");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn deny_one(&self, dir: &Path, requested: &Device) -> Result<()> {
        let already_wider = {
            let listing = self.fs.read_devices_list(dir)?;
            listing.lines().filter_map(Device::parse).any(|existing| existing.is_wider_than(requested))
        };
        if already_wider {
            debug!(cgroup = %dir.display(), device = %requested, "a wider rule remains, skipping deny");
            return Ok(());
        }

        let key = (dir.to_path_buf(), requested.major.unwrap(), requested.minor.unwrap());
        let mut refcounts = self.refcounts.lock().unwrap();
        let should_write = match refcounts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                refcounts.remove(&key);
                true
            }
            // No tracked allow for this key: either allow_one skipped the
            // write because a wider rule covered it, or allow was never
            // called. Either way this broker never wrote the narrower rule,
            // so it must not be the one to revoke it.
            None => false,
        };
        drop(refcounts);

        if should_write {
            self.fs.write_devices_deny(dir, &requested.to_line())?;
        }
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_and_exact_lines() {
        let exact = Device::parse("c 240:3 rwm").unwrap();
        assert_eq!(exact.major, Some(240));
        assert_eq!(exact.minor, Some(3));

        let wild = Device::parse("c *:* rwm").unwrap();
        assert_eq!(wild.major, None);
        assert_eq!(wild.minor, None);
    }

    #[test]
    fn all_type_widens_any_char_device() {
        let all = Device { dtype: 'a', major: None, minor: None, modes: "rwm".chars().collect() };
        let requested = Device::exact('c', 240, 3, "rwm");
        assert!(all.is_wider_than(&requested));
    }

    #[test]
    fn wildcard_major_widens_any_minor_of_matching_type() {
        let existing = Device { dtype: 'c', major: None, minor: Some(3), modes: "rwm".chars().collect() };
        let requested = Device::exact('c', 240, 3, "rwm");
        assert!(existing.is_wider_than(&requested));
        let mismatched_minor = Device::exact('c', 240, 7, "rwm");
        assert!(!existing.is_wider_than(&mismatched_minor));
    }

    #[test]
    fn narrower_modes_do_not_widen() {
        let existing = Device::exact('c', 240, 3, "r");
        let requested = Device::exact('c', 240, 3, "rwm");
        assert!(!existing.is_wider_than(&requested));
    }

    #[test]
    fn allow_skips_write_when_already_authorised() {
        let mut fs = MockCgroupFs::new();
        fs.expect_expand_glob().returning(|_, _| Ok(vec![PathBuf::from("/cg/ctr0")]));
        fs.expect_read_devices_list().returning(|_| Ok("c 240:3 rwm\n".to_string()));
        fs.expect_write_devices_allow().never();

        let broker = CgroupBroker::new(PathBuf::from("/sys/fs/cgroup/devices"), std::sync::Arc::new(fs));
        broker.allow("pod-*/ctr*", 240, 3).unwrap();
    }

    #[test]
    fn deny_does_not_punch_a_hole_through_a_pre_existing_wider_rule() {
        let mut fs = MockCgroupFs::new();
        fs.expect_expand_glob().returning(|_, _| Ok(vec![PathBuf::from("/cg/ctr0")]));
        fs.expect_read_devices_list().returning(|_| Ok("a *:* rwm\n".to_string()));
        fs.expect_write_devices_allow().never();
        fs.expect_write_devices_deny().never();

        let broker = CgroupBroker::new(PathBuf::from("/sys/fs/cgroup/devices"), std::sync::Arc::new(fs));
        broker.allow("pod-*/ctr*", 240, 3).unwrap();
        broker.deny("pod-*/ctr*", 240, 3).unwrap();
    }

    #[test]
    fn allow_writes_once_and_deny_only_on_last_release() {
        let mut fs = MockCgroupFs::new();
        fs.expect_expand_glob().returning(|_, _| Ok(vec![PathBuf::from("/cg/ctr0")]));
        fs.expect_read_devices_list().returning(|_| Ok(String::new()));
        fs.expect_write_devices_allow().times(1).returning(|_, _| Ok(()));
        fs.expect_write_devices_deny().times(1).returning(|_, _| Ok(()));

        let broker = CgroupBroker::new(PathBuf::from("/sys/fs/cgroup/devices"), std::sync::Arc::new(fs));
        broker.allow("pod-*/ctr*", 240, 3).unwrap();
        broker.allow("pod-*/ctr*", 240, 3).unwrap();
        broker.deny("pod-*/ctr*", 240, 3).unwrap();
        broker.deny("pod-*/ctr*", 240, 3).unwrap();
    }

    #[test]
    fn linux_cgroup_fs_round_trips_against_a_real_directory_tree() {
        let root = tempfile::tempdir().unwrap();
        let ctr_dir = root.path().join("pod-abc/ctr0");
        std::fs::create_dir_all(&ctr_dir).unwrap();
        std::fs::write(ctr_dir.join("devices.list"), "").unwrap();

        let fs = LinuxCgroupFs::new();
        let matches = fs.expand_glob(root.path(), "pod-*/ctr*").unwrap();
        assert_eq!(matches, vec![ctr_dir.clone()]);

        assert_eq!(fs.read_devices_list(&ctr_dir).unwrap(), "");

        fs.write_devices_allow(&ctr_dir, "c 240:3 rwm").unwrap();
        assert_eq!(std::fs::read_to_string(ctr_dir.join("devices.allow")).unwrap(), "c 240:3 rwm");

        fs.write_devices_deny(&ctr_dir, "c 240:3 rwm").unwrap();
        assert_eq!(std::fs::read_to_string(ctr_dir.join("devices.deny")).unwrap(), "c 240:3 rwm");
    }

    #[test]
    fn broker_allow_and_deny_against_a_real_cgroup_tree() {
        let root = tempfile::tempdir().unwrap();
        let ctr_dir = root.path().join("pod-xyz/ctr0");
        std::fs::create_dir_all(&ctr_dir).unwrap();
        std::fs::write(ctr_dir.join("devices.list"), "").unwrap();

        let broker = CgroupBroker::new(root.path().to_path_buf(), std::sync::Arc::new(LinuxCgroupFs::new()));
        broker.allow("pod-*/ctr*", 241, 5).unwrap();
        assert_eq!(std::fs::read_to_string(ctr_dir.join("devices.allow")).unwrap(), "c 241:5 rwm");

        broker.deny("pod-*/ctr*", 241, 5).unwrap();
        assert_eq!(std::fs::read_to_string(ctr_dir.join("devices.deny")).unwrap(), "c 241:5 rwm");
    }
}

/* ---------------------------------------------------------------------------------------------- */
