use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};

use nix::unistd::geteuid;
use tracing::debug;

use crate::caps;
use crate::error::{Error, Result};
use crate::identity::Identity;

// identity a helper runs under; HidepidRoot keeps just enough capability
// to read /proc mounted with hidepid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerIdentity {
    User,
    Root,
    HidepidRoot,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerProfile {
    pub identity: WorkerIdentity,
    pub seccomp: bool,
    pub caps_none: bool,
    pub allow_stdin: bool,
}

impl WorkerProfile {
    pub fn user() -> Self {
        WorkerProfile {
            identity: WorkerIdentity::User,
            seccomp: true,
            caps_none: true,
            allow_stdin: false,
        }
    }

    pub fn hidepid_root() -> Self {
        WorkerProfile {
            identity: WorkerIdentity::HidepidRoot,
            seccomp: true,
            caps_none: false,
            allow_stdin: false,
        }
    }

    pub fn with_stdin(mut self) -> Self {
        self.allow_stdin = true;
        self
    }
}

// spawn a helper under a restricted identity and wait for it; the current
// euid must already match the declared identity
pub fn run(identity: &Identity, profile: WorkerProfile, program: &str, args: &[&str]) -> Result<i32> {
    match profile.identity {
        WorkerIdentity::User => {
            assert_eq!(geteuid(), identity.uid, "worker profile expects user euid")
        }
        WorkerIdentity::Root | WorkerIdentity::HidepidRoot => {
            assert!(geteuid().is_root(), "worker profile expects root euid")
        }
    }
    debug!(program, ?args, "spawning worker");

    let mut cmd = Command::new(program);
    cmd.args(args);

    match profile.identity {
        WorkerIdentity::User => {
            cmd.uid(identity.uid.as_raw());
            cmd.gid(identity.gid.as_raw());
        }
        WorkerIdentity::Root | WorkerIdentity::HidepidRoot => {
            cmd.uid(0);
            cmd.gid(0);
        }
    }

    if !profile.allow_stdin {
        cmd.stdin(Stdio::null());
    }

    // shrinking the flat capability sets needs no privilege, so caps-none
    // also works for user workers
    let caps_keep = if profile.caps_none {
        Some(0u64)
    } else if profile.identity == WorkerIdentity::HidepidRoot {
        Some(
            (1u64 << caps::index("sys_ptrace").unwrap())
                | (1u64 << caps::index("dac_read_search").unwrap()),
        )
    } else {
        None
    };
    let seccomp = profile.seccomp;
    unsafe {
        cmd.pre_exec(move || {
            if let Some(keep) = caps_keep {
                caps::set_flat(keep)?;
            }
            if seccomp {
                // the helper installs its own filter; make sure it sticks
                let rv = libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
                if rv == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let status = cmd
        .status()
        .map_err(|e| Error::Io {
            ctx: format!("cannot run {}", program),
            err: e,
        })?;

    Ok(status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::unistd::{getgid, getuid};
    use std::path::PathBuf;

    fn identity() -> Identity {
        Identity {
            username: "tester".into(),
            uid: getuid(),
            gid: getgid(),
            home: PathBuf::from("/"),
            cwd: PathBuf::from("/"),
        }
    }

    #[test]
    fn propagates_exit_code() {
        let rv = run(
            &identity(),
            WorkerProfile::user(),
            "/bin/sh",
            &["-c", "exit 7"],
        )
        .unwrap();
        assert_eq!(rv, 7);
    }

    #[test]
    fn missing_helper_is_io_error() {
        assert!(run(&identity(), WorkerProfile::user(), "/nonexistent/helper", &[]).is_err());
    }
}
