use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, trace};

use crate::error::{Ctx, Error, Result};
use crate::identity::RootToken;
use crate::netconf::NetworkConfig;
use crate::paths;

// process-wide registry of live sandboxes under /run/burrow, keyed by the
// launcher pid; every mutation holds the exclusive run lock
pub struct RunRegistry {
    root: PathBuf,
}

impl RunRegistry {
    pub fn system() -> Self {
        RunRegistry {
            root: PathBuf::from(paths::RUN_DIR),
        }
    }

    // tests point the registry at a scratch directory
    pub fn at(root: impl Into<PathBuf>) -> Self {
        RunRegistry { root: root.into() }
    }

    fn record_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    pub fn build(&self, _root: RootToken<'_>) -> Result<()> {
        fs::create_dir_all(&self.root).ctx("mkdir run dir")?;
        fs::set_permissions(&self.root, Permissions::from_mode(0o755))
            .ctx("chmod run dir")?;
        Ok(())
    }

    fn lock(&self) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join("burrow.lock"))
            .ctx("open run lock")?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, err)| Error::Sys {
            ctx: "flock run lock".into(),
            err,
        })
    }

    // remove records whose owner pid is gone; suppressed inside a nested
    // sandbox so a child launcher does not clobber the host registry
    pub fn sweep_dead(&self, _root: RootToken<'_>) -> Result<()> {
        if std::env::var(paths::CONTAINER_ENV).as_deref() == Ok(paths::CONTAINER_NAME) {
            trace!("nested sandbox, skipping registry sweep");
            return Ok(());
        }

        let _lock = self.lock()?;
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io { ctx: "read run dir".into(), err: e }),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            if !Path::new("/proc").join(pid.to_string()).exists() {
                debug!(pid, "sweeping dead sandbox record");
                // a concurrent sweep may have won the race
                match fs::remove_dir_all(entry.path()) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::Io { ctx: "sweep record".into(), err: e }),
                }
            }
        }
        Ok(())
    }

    pub fn register(&self, _root: RootToken<'_>, pid: i32, name: Option<&str>) -> Result<()> {
        let _lock = self.lock()?;
        let dir = self.record_dir(pid);
        fs::create_dir_all(&dir).ctx("create run record")?;
        if let Some(name) = name {
            fs::write(dir.join("name"), format!("{}\n", name)).ctx("write name record")?;
        }
        // the filesystem assembly appends its audit trail here
        fs::write(dir.join("fslog"), "").ctx("write fslog record")?;
        Ok(())
    }

    pub fn delete(&self, _root: RootToken<'_>, pid: i32) -> Result<()> {
        let _lock = self.lock()?;
        match fs::remove_dir_all(self.record_dir(pid)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { ctx: "delete run record".into(), err: e }),
        }
    }

    // a user-supplied token is either a decimal pid or a sandbox name
    pub fn find_by_name(&self, token: &str) -> Result<i32> {
        if token.is_empty() {
            return Err(Error::config("invalid sandbox name"));
        }
        if let Ok(pid) = token.parse::<i32>() {
            return Ok(pid);
        }

        // readers run without the lock and tolerate concurrent removal
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let Some(pid) = entry
                    .file_name()
                    .to_str()
                    .and_then(|s| s.parse::<i32>().ok())
                else {
                    continue;
                };
                if let Ok(name) = fs::read_to_string(entry.path().join("name")) {
                    if name.trim_end() == token {
                        return Ok(pid);
                    }
                }
            }
        }
        Err(Error::config(format!("cannot find sandbox {}", token)))
    }

    // profile snapshot: loaded profile paths, then the raw directives
    pub fn write_profile(
        &self,
        _root: RootToken<'_>,
        pid: i32,
        profiles: &[PathBuf],
        entries: &[String],
    ) -> Result<()> {
        let mut out = String::new();
        for p in profiles {
            out.push_str(&format!("# {}\n", p.display()));
        }
        for e in entries {
            out.push_str(e);
            out.push('\n');
        }
        fs::write(self.record_dir(pid).join("profile"), out).ctx("write profile record")?;
        Ok(())
    }

    pub fn read_profile(&self, pid: i32) -> Result<String> {
        fs::read_to_string(self.record_dir(pid).join("profile"))
            .map_err(|_| Error::config(format!("cannot find sandbox {}", pid)))
    }

    // host-side request for the network worker, one JSON line
    pub fn write_netmap(
        &self,
        _root: RootToken<'_>,
        pid: i32,
        net: &NetworkConfig,
    ) -> Result<()> {
        let json = serde_json::to_string(net)
            .map_err(|e| Error::config(format!("cannot encode network map: {}", e)))?;
        fs::write(self.record_dir(pid).join("netmap"), json + "\n").ctx("write netmap record")?;
        Ok(())
    }

    pub fn read_netmap(&self, pid: i32) -> Result<NetworkConfig> {
        let data = fs::read_to_string(self.record_dir(pid).join("netmap"))
            .map_err(|_| Error::config(format!("cannot find sandbox {}", pid)))?;
        serde_json::from_str(data.trim_end())
            .map_err(|e| Error::config(format!("corrupt network map: {}", e)))
    }

    pub fn record_count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| {
                        e.file_name()
                            .to_str()
                            .map(|s| s.parse::<i32>().is_ok())
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::test_token;

    #[test]
    fn register_find_delete() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::at(dir.path());
        reg.build(test_token()).unwrap();

        let before = reg.record_count();
        reg.register(test_token(), 12345, Some("mybox")).unwrap();
        assert_eq!(reg.record_count(), before + 1);

        assert_eq!(reg.find_by_name("mybox").unwrap(), 12345);
        assert_eq!(reg.find_by_name("12345").unwrap(), 12345);
        assert!(reg.find_by_name("otherbox").is_err());
        assert!(reg.find_by_name("").is_err());

        reg.delete(test_token(), 12345).unwrap();
        assert_eq!(reg.record_count(), before);
        // deleting twice is fine
        reg.delete(test_token(), 12345).unwrap();
    }

    #[test]
    fn sweep_removes_dead_records() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::at(dir.path());
        reg.build(test_token()).unwrap();

        let own_pid = std::process::id() as i32;
        reg.register(test_token(), own_pid, None).unwrap();
        // no such pid on any sane system
        reg.register(test_token(), i32::MAX - 7, None).unwrap();
        assert_eq!(reg.record_count(), 2);

        // inside a nested sandbox the sweep must leave the records alone
        std::env::set_var(paths::CONTAINER_ENV, paths::CONTAINER_NAME);
        reg.sweep_dead(test_token()).unwrap();
        assert_eq!(reg.record_count(), 2);
        std::env::remove_var(paths::CONTAINER_ENV);

        reg.sweep_dead(test_token()).unwrap();
        assert_eq!(reg.record_count(), 1);
        assert!(reg.find_by_name(&own_pid.to_string()).is_ok());
    }

    #[test]
    fn profile_and_netmap_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::at(dir.path());
        reg.build(test_token()).unwrap();
        reg.register(test_token(), 777, None).unwrap();

        reg.write_profile(
            test_token(),
            777,
            &[PathBuf::from("/etc/burrow/app.profile")],
            &["blacklist /usr/share".into()],
        )
        .unwrap();
        let snapshot = reg.read_profile(777).unwrap();
        assert!(snapshot.contains("# /etc/burrow/app.profile"));
        assert!(snapshot.contains("blacklist /usr/share"));

        let mut net = NetworkConfig::default();
        net.add_dns("1.1.1.1").unwrap();
        reg.write_netmap(test_token(), 777, &net).unwrap();
        assert_eq!(reg.read_netmap(777).unwrap(), net);

        assert!(reg.read_profile(778).is_err());
    }
}
