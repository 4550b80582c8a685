use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, read, Group, Pid};
use tracing::{debug, trace, warn};

use crate::child;
use crate::error::{Ctx, Error, Result};
use crate::identity::IdentityGate;
use crate::paths;
use crate::pipes::Rendezvous;
use crate::policy::Policy;
use crate::registry::RunRegistry;
use crate::worker::{self, WorkerIdentity, WorkerProfile};

const STACK_SIZE: usize = 1024 * 1024;

// groups mapped into a noroot user namespace next to the user's own
const ANCILLARY_GROUPS: &[&str] = &["tty", "audio", "video", "games"];

fn fmessage(policy: &Policy, msg: &str) {
    if !policy.quiet && !policy.command_mode {
        println!("{}", msg);
    }
}

// a signal registered through the self-pipe; the handler only writes a
// byte, everything else happens on the main flow
struct SignalPipe {
    rx: OwnedFd,
}

impl SignalPipe {
    fn install(signal: i32) -> Result<Self> {
        let (rx, tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).ctx("pipe2")?;
        signal_hook::low_level::pipe::register(signal, File::from(tx))
            .ctx("register signal pipe")?;
        Ok(SignalPipe { rx })
    }

    fn drain(&self) -> bool {
        let mut buf = [0u8; 16];
        let mut fired = false;
        while let Ok(n) = read(&self.rx, &mut buf) {
            if n == 0 {
                break;
            }
            fired = true;
        }
        fired
    }
}

fn write_id_maps(gate: &IdentityGate, policy: &Policy, child: Pid) -> Result<()> {
    let uid = policy.identity.uid.as_raw();
    let gid = policy.identity.gid.as_raw();

    let mut gid_map = format!("{} {} 1\n", gid, gid);
    if !policy.nogroups {
        for name in ANCILLARY_GROUPS {
            if let Ok(Some(group)) = Group::from_name(name) {
                let g = group.gid.as_raw();
                gid_map.push_str(&format!("{} {} 1\n", g, g));
            }
        }
    }

    gate.as_root(|_| {
        // the map writes are the one step that must not run de-escalated
        gate.assert_root();
        std::fs::write(
            format!("/proc/{}/uid_map", child),
            format!("{} {} 1\n", uid, uid),
        )
        .ctx("write uid_map")?;
        std::fs::write(format!("/proc/{}/gid_map", child), &gid_map).ctx("write gid_map")?;
        Ok(())
    })
}

fn exit_status_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

// parent half of the construction protocol; returns the exit code to
// propagate
pub fn run(gate: &IdentityGate, registry: &RunRegistry, policy: &Policy) -> Result<i32> {
    // PREPARE: rendezvous pipes and the run record, under the run lock
    let sync = Rendezvous::new()?;
    gate.as_root(|root| {
        registry.build(root)?;
        registry.register(root, policy.sandbox_pid, policy.name.as_deref())?;
        registry.write_profile(
            root,
            policy.sandbox_pid,
            &policy.loaded_profiles,
            &policy.profile_entries,
        )?;
        if policy.network.needs_worker() {
            registry.write_netmap(root, policy.sandbox_pid, &policy.network)?;
        }
        Ok(())
    })?;

    // SPAWN: new namespaces for the child; the user namespace is opted
    // into by the child itself, never here
    let mut flags =
        CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS;
    if policy.identity.uid.is_root() || policy.ipc {
        debug!("enabling IPC namespace");
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if policy.network.wants_netns() {
        flags |= CloneFlags::CLONE_NEWNET;
    } else {
        debug!("using the local network stack");
    }

    let mut stack = vec![0u8; STACK_SIZE];
    let child_pid = gate.as_root(|_| {
        unsafe {
            nix::sched::clone(
                Box::new(|| child::main(policy, &sync)),
                &mut stack,
                flags,
                Some(libc::SIGCHLD),
            )
        }
        .ctx("clone")
    })?;
    fmessage(
        policy,
        &format!("Parent pid {}, child pid {}", policy.sandbox_pid, child_pid),
    );

    // the parent keeps one end of each pipe; the child copy owns the rest
    let mut sync = sync;
    sync.to_child.drop_rx();
    sync.to_parent.drop_tx();

    // NETWORK WORKER: host-side interface wiring against the child's pid,
    // must finish before the child is released
    if policy.network.needs_worker() {
        let netmap = format!(
            "{}/{}/netmap",
            paths::RUN_DIR,
            policy.sandbox_pid
        );
        let child_str = child_pid.to_string();
        let rv = gate.as_root(|_| {
            worker::run(
                &policy.identity,
                WorkerProfile {
                    identity: WorkerIdentity::Root,
                    seccomp: false,
                    caps_none: false,
                    allow_stdin: false,
                },
                paths::PATH_BNET,
                &["setup", &child_str, &netmap],
            )
        })?;
        if rv != 0 {
            warn!(rv, "network worker failed");
        } else {
            debug!("host network configured");
        }
    }

    gate.assert_user();

    // RELEASE-1: base setup complete
    sync.to_child.notify()?;

    // WAIT-USERNS: the child reports its user namespace (or lack of one)
    sync.to_parent.wait()?;

    // MAP: one-to-one uid/gid maps, written strictly after the ready byte
    if policy.noroot {
        write_id_maps(gate, policy, child_pid)?;
    }

    // RELEASE-2: maps in place, the child may exec
    sync.to_child.notify()?;

    // WAIT: self-pipe signal forwarding; SIGINT/SIGTERM become SIGTERM to
    // the child, SIGCHLD ends the wait
    let sigint = SignalPipe::install(libc::SIGINT)?;
    let sigterm = SignalPipe::install(libc::SIGTERM)?;
    let sigchld = SignalPipe::install(libc::SIGCHLD)?;

    // the child may have exited before the pipes went in
    if let Some(code) = exit_status_of(
        waitpid(child_pid, Some(WaitPidFlag::WNOHANG)).ctx("waitpid")?,
    ) {
        return Ok(code);
    }

    loop {
        let mut fds = [
            PollFd::new(sigint.rx.as_fd(), PollFlags::POLLIN),
            PollFd::new(sigterm.rx.as_fd(), PollFlags::POLLIN),
            PollFd::new(sigchld.rx.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::Error::EINTR) => continue,
            Err(err) => {
                return Err(Error::Sys {
                    ctx: "poll".into(),
                    err,
                })
            }
        }

        for (pipe, signo) in [(&sigint, libc::SIGINT), (&sigterm, libc::SIGTERM)] {
            if pipe.drain() {
                fmessage(
                    policy,
                    &format!(
                        "\nParent received signal {}, shutting down the child process...",
                        signo
                    ),
                );
                let _ = gate.as_root(|_| kill(child_pid, Signal::SIGTERM).ctx("kill child"));
                return Ok(1);
            }
        }

        if sigchld.drain() {
            trace!("child state change");
            match waitpid(child_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    if let Some(code) = exit_status_of(status) {
                        debug!(code, "child exited");
                        return Ok(code);
                    }
                }
                Err(nix::Error::ECHILD) => return Err(Error::ChildCrash),
                Err(err) => {
                    return Err(Error::Sys {
                        ctx: "waitpid".into(),
                        err,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_status_mapping() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_status_of(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_status_of(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(128 + 9)
        );
        assert_eq!(exit_status_of(WaitStatus::StillAlive), None);
    }

    #[test]
    fn signal_pipe_reports_once_per_drain() {
        let pipe = SignalPipe::install(libc::SIGUSR1).unwrap();
        assert!(!pipe.drain());
        signal_hook::low_level::raise(libc::SIGUSR1).unwrap();
        assert!(pipe.drain());
        assert!(!pipe.drain());
    }
}
