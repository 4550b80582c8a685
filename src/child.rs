use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use libc::{sock_filter, sock_fprog, syscall, SYS_seccomp};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{
    alarm, chdir, execvp, initgroups, sethostname, setresgid, setresuid,
};
use tracing::{debug, trace, warn};

use crate::caps;
use crate::error::{Ctx, Error, Result};
use crate::fsops;
use crate::paths;
use crate::pipes::Rendezvous;
use crate::policy::{Policy, Program};
use crate::sysres;
use crate::worker::{self, WorkerIdentity, WorkerProfile};

// kernel 6.3
const PR_SET_MDWE: libc::c_int = 65;
const PR_MDWE_REFUSE_EXEC_GAIN: libc::c_ulong = 1;

// musl is missing this
const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;

fn filter_path(pid: i32) -> PathBuf {
    PathBuf::from(paths::RUN_DIR)
        .join(pid.to_string())
        .join("seccomp")
}

// ask the external builder to compile the BPF program for this policy
fn build_filter(policy: &Policy) -> Result<()> {
    let out = filter_path(policy.sandbox_pid);
    let out = out.to_string_lossy();
    let mut args: Vec<String> = vec!["build".into(), out.into_owned()];
    if let Some(list) = &policy.seccomp.list {
        args.push(format!("--drop={}", list));
    }
    if let Some(drop) = &policy.seccomp.drop {
        args.push(format!("--drop-only={}", drop));
    }
    if let Some(keep) = &policy.seccomp.keep {
        args.push(format!("--keep-only={}", keep));
    }
    if policy.seccomp.block_secondary {
        args.push("--block-secondary".into());
    }
    if let Some(protocol) = &policy.seccomp.protocol {
        args.push(format!("--protocol={}", protocol));
    }

    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let profile = WorkerProfile {
        identity: WorkerIdentity::Root,
        seccomp: false,
        caps_none: false,
        allow_stdin: false,
    };
    let rv = worker::run(&policy.identity, profile, paths::PATH_FSEC, &args)?;
    if rv != 0 {
        return Err(Error::config("cannot build seccomp filter"));
    }
    Ok(())
}

// install the compiled program; raw sock_filter records, host endian
fn install_filter(policy: &Policy) -> Result<()> {
    let bytes = fs::read(filter_path(policy.sandbox_pid)).ctx("read seccomp filter")?;
    if bytes.len() % 8 != 0 || bytes.is_empty() {
        return Err(Error::config("corrupt seccomp filter"));
    }
    let mut filter: Vec<sock_filter> = bytes
        .chunks_exact(8)
        .map(|c| sock_filter {
            code: u16::from_ne_bytes([c[0], c[1]]),
            jt: c[2],
            jf: c[3],
            k: u32::from_ne_bytes([c[4], c[5], c[6], c[7]]),
        })
        .collect();
    let prog = sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_mut_ptr(),
    };
    unsafe {
        sysres(syscall(
            SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0,
            &prog as *const sock_fprog,
        ))
        .ctx("seccomp")?;
    }
    Ok(())
}

fn exec_argv(policy: &Policy) -> Result<Vec<CString>> {
    let strings: Vec<String> = match &policy.program {
        Program::Shell { path } => vec![path.display().to_string()],
        Program::Command { argv } => argv.clone(),
        Program::AppImage { path, argv } => std::iter::once(path.clone())
            .chain(argv.iter().cloned())
            .collect(),
    };
    strings
        .into_iter()
        .map(|s| CString::new(s).map_err(|_| Error::config("invalid program argument")))
        .collect()
}

fn setup(policy: &Policy, sync: &Rendezvous) -> Result<std::convert::Infallible> {
    // die with the parent instead of lingering half-built
    prctl::set_pdeathsig(Signal::SIGKILL).ctx("prctl(PR_SET_PDEATHSIG)")?;

    // base setup complete on the parent side
    sync.to_child.wait()?;

    umask(Mode::from_bits_truncate(0o022));

    // keep mount changes out of the host namespace
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .ctx("remount / private")?;

    // fresh /proc for the new pid namespace
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .ctx("mount /proc")?;

    if let Some(hostname) = &policy.hostname {
        sethostname(hostname).ctx("sethostname")?;
    }

    trace!("applying filesystem directives");
    fsops::apply(policy)?;

    if policy.seccomp.enabled {
        build_filter(policy)?;
    }

    if policy.apparmor {
        // transition into the confinement profile at exec time
        if let Err(e) = fs::write("/proc/self/attr/exec", "exec burrow-default") {
            warn!("cannot set apparmor exec profile: {}", e);
        }
    }

    if policy.seccomp.mdwx {
        // refuse writable-executable mappings from here on
        unsafe {
            sysres(libc::prctl(PR_SET_MDWE, PR_MDWE_REFUSE_EXEC_GAIN, 0, 0, 0))
                .ctx("prctl(PR_SET_MDWE)")?;
        }
    }

    if policy.no_new_privs || policy.seccomp.enabled {
        prctl::set_no_new_privs().ctx("prctl(PR_SET_NO_NEW_PRIVS)")?;
    }

    // capability transition survives the uid switch until execve
    prctl::set_keepcaps(true).ctx("prctl(PR_SET_KEEPCAPS)")?;

    let keep_mask = policy.caps.resolve();
    if let Some(mask) = keep_mask {
        // bounding drops need CAP_SETPCAP, so they happen while still root
        caps::apply_keep(mask)?;
    }

    // drop to the invoking user
    let uid = policy.identity.uid;
    let gid = policy.identity.gid;
    if policy.nogroups {
        nix::unistd::setgroups(&[]).ctx("setgroups")?;
    } else {
        let user = CString::new(policy.identity.username.as_str())
            .map_err(|_| Error::config("invalid username"))?;
        if let Err(e) = initgroups(&user, gid) {
            warn!("cannot set supplementary groups: {}", e);
        }
    }
    setresgid(gid, gid, gid).ctx("setresgid")?;
    setresuid(uid, uid, uid).ctx("setresuid")?;

    if policy.noroot {
        // opt into a user namespace; the parent installs the one-to-one
        // maps once it sees the ready byte
        unshare(CloneFlags::CLONE_NEWUSER).ctx("unshare(CLONE_NEWUSER)")?;
    }
    sync.to_parent.notify()?;

    // uid/gid maps are in place
    sync.to_child.wait()?;

    if policy.seccomp.enabled {
        install_filter(policy)?;
    }

    // environment of the sandboxed program
    std::env::set_var(paths::CONTAINER_ENV, paths::CONTAINER_NAME);
    if let Program::Shell { path } = &policy.program {
        std::env::set_var("SHELL", path);
    }
    policy.env.apply();

    if chdir(&policy.identity.cwd).is_err() {
        debug!(cwd = %policy.identity.cwd.display(), "cannot enter working directory");
        let _ = chdir(&policy.identity.home).or_else(|_| chdir(Path::new("/")));
    }

    // alarm(2) survives execve, which makes it a free timeout carrier
    if let Some(secs) = policy.timeout {
        let _ = alarm::set(secs);
    }

    let argv = exec_argv(policy)?;
    debug!(?argv, "executing program");
    execvp(&argv[0], &argv).ctx("execvp")?;
    unreachable!();
}

// clone callback: never unwind across the ffi boundary, report and _exit
pub fn main(policy: &Policy, sync: &Rendezvous) -> isize {
    match setup(policy, sync) {
        Err(Error::ChildCrash) => {
            // parent died before releasing us; nothing to report
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
        Ok(never) => match never {},
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::Program;

    #[test]
    fn exec_argv_shapes() {
        use crate::identity::Identity;
        use nix::unistd::{Gid, Uid};

        let identity = Identity {
            username: "tester".into(),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home: "/home/tester".into(),
            cwd: "/home/tester".into(),
        };
        let conf = crate::conf::FeatureConf::default();
        let builder = crate::policy::PolicyBuilder::new(&conf, identity, 1);
        let policy = builder
            .finish(Some(vec!["/bin/echo".into(), "hello".into()]))
            .unwrap();
        let argv = exec_argv(&policy).unwrap();
        assert_eq!(argv[0].to_str().unwrap(), "/bin/echo");
        assert_eq!(argv[1].to_str().unwrap(), "hello");
        assert!(matches!(policy.program, Program::Command { .. }));
    }
}
