use std::ffi::CString;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use libc::{syscall, SYS_pidfd_open};
use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, execvp, fork, setresgid, setresuid, ForkResult, Pid};
use tracing::{debug, trace};

use crate::error::{Ctx, Error, Result};
use crate::identity::{Identity, IdentityGate};
use crate::registry::RunRegistry;
use crate::sysres;

struct PidFd(OwnedFd);

impl PidFd {
    fn open(pid: i32) -> Result<Self> {
        let fd = unsafe { sysres(syscall(SYS_pidfd_open, pid, 0)).ctx("pidfd_open")? };
        Ok(PidFd(unsafe { OwnedFd::from_raw_fd(fd as i32) }))
    }
}

impl AsFd for PidFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinScope {
    All,
    Network,
    Filesystem,
}

fn resolve_target(registry: &RunRegistry, target: &str) -> Result<i32> {
    let pid = registry.find_by_name(target)?;
    if !Path::new("/proc").join(pid.to_string()).exists() {
        return Err(Error::config(format!("cannot find sandbox {}", target)));
    }
    Ok(pid)
}

// enter the namespaces of a running sandbox and exec a program there
pub fn join(
    gate: &IdentityGate,
    registry: &RunRegistry,
    identity: &Identity,
    scope: JoinScope,
    target: &str,
    program_argv: Option<Vec<String>>,
    shell: Option<PathBuf>,
) -> Result<i32> {
    let pid = resolve_target(registry, target)?;
    debug!(pid, ?scope, "joining sandbox");
    let pidfd = PidFd::open(pid)?;

    let argv: Vec<String> = match program_argv {
        Some(argv) => argv,
        None => {
            let shell = shell.ok_or_else(|| {
                Error::config("unable to guess your shell, please set explicitly by using --shell option")
            })?;
            vec![shell.display().to_string()]
        }
    };
    let cargv: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_str()).map_err(|_| Error::config("invalid program argument")))
        .collect::<Result<_>>()?;

    gate.as_root(|_| {
        match scope {
            JoinScope::Network => setns(&pidfd, CloneFlags::CLONE_NEWNET).ctx("setns")?,
            JoinScope::Filesystem => setns(&pidfd, CloneFlags::CLONE_NEWNS).ctx("setns")?,
            JoinScope::All => {
                setns(
                    &pidfd,
                    CloneFlags::CLONE_NEWNS
                        | CloneFlags::CLONE_NEWUTS
                        | CloneFlags::CLONE_NEWIPC
                        | CloneFlags::CLONE_NEWNET,
                )
                .ctx("setns")?;
                // pid namespace applies to children only
                setns(&pidfd, CloneFlags::CLONE_NEWPID).ctx("setns")?;
                // joining our own user namespace reports EINVAL; fine
                match setns(&pidfd, CloneFlags::CLONE_NEWUSER) {
                    Ok(_) | Err(Errno::EINVAL) => {}
                    Err(err) => {
                        return Err(Error::Sys {
                            ctx: "setns user".into(),
                            err,
                        })
                    }
                }
            }
        }

        // fork so the child lands in the target pid namespace
        match unsafe { fork() }.ctx("fork")? {
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).ctx("waitpid")?;
                Ok(match status {
                    WaitStatus::Exited(_, code) => code,
                    WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
                    _ => 0,
                })
            }
            ForkResult::Child => {
                let gid = identity.gid;
                let uid = identity.uid;
                if setresgid(gid, gid, gid).is_err() || setresuid(uid, uid, uid).is_err() {
                    std::process::exit(1);
                }
                if chdir(&identity.home).is_err() {
                    let _ = chdir(Path::new("/"));
                }
                trace!(?argv, "exec in joined sandbox");
                let _ = execvp(&cargv[0], &cargv);
                // exec failed; nothing sensible left to do
                std::process::exit(1);
            }
        }
    })
}

// SIGTERM to the target launcher, escalating to SIGKILL if it survives
pub fn shutdown(gate: &IdentityGate, registry: &RunRegistry, target: &str) -> Result<i32> {
    let pid = resolve_target(registry, target)?;
    debug!(pid, "shutting down sandbox");

    gate.as_root(|_| kill(Pid::from_raw(pid), Signal::SIGTERM).ctx("kill"))?;

    for _ in 0..20 {
        if !Path::new("/proc").join(pid.to_string()).exists() {
            return Ok(0);
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    gate.as_root(|_| {
        // still alive after the grace period
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(_) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(Error::Sys {
                ctx: "kill".into(),
                err,
            }),
        }
    })?;
    Ok(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::test_token;

    #[test]
    fn resolve_rejects_dead_and_unknown_targets() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::at(dir.path());
        reg.build(test_token()).unwrap();

        // record whose pid is long gone
        reg.register(test_token(), i32::MAX - 9, Some("stale")).unwrap();
        assert!(resolve_target(&reg, "stale").is_err());
        assert!(resolve_target(&reg, "nosuch").is_err());

        let own = std::process::id() as i32;
        reg.register(test_token(), own, Some("live")).unwrap();
        assert_eq!(resolve_target(&reg, "live").unwrap(), own);
        assert_eq!(resolve_target(&reg, &own.to_string()).unwrap(), own);
    }
}
