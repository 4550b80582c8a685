use std::path::{Path, PathBuf};

use crate::arglex::{Item, Token};
use crate::caps;
use crate::conf::{Feature, FeatureConf};
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityGate};
use crate::join::{self, JoinScope};
use crate::paths;
use crate::policy::PolicyBuilder;
use crate::registry::RunRegistry;
use crate::shell::guess_shell;
use crate::worker::{self, WorkerProfile};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// query-and-exit options, handled before the policy builder runs; a
// Some(code) result means the launcher is done
pub struct Shortcuts<'a> {
    pub gate: &'a IdentityGate,
    pub conf: &'a FeatureConf,
    pub registry: &'a RunRegistry,
    pub identity: &'a Identity,
}

fn usage() {
    println!("Usage: burrow [OPTIONS] [program and arguments]");
    println!();
    println!("Start a program in a private Linux namespace sandbox.");
    println!();
    println!("Common options:");
    println!("    --profile=FILE     load a sandbox profile");
    println!("    --noprofile        skip the default profile");
    println!("    --seccomp          enable the default syscall filter");
    println!("    --caps.drop=all    drop all capabilities");
    println!("    --net=none         detach from the network");
    println!("    --private          mount a throwaway home directory");
    println!("    --noroot           run in a user namespace without root");
    println!("    --list             list running sandboxes");
    println!("    --join=NAME|PID    enter a running sandbox");
    println!("    --shutdown=NAME|PID stop a running sandbox");
    println!("    --help, --version");
    println!();
    println!("See the burrow man page for the complete option list.");
}

// hidepid mounts hide other users' processes from the monitor unless it
// keeps ptrace-adjacent capabilities
fn proc_hidepid() -> bool {
    std::fs::read_to_string("/proc/mounts")
        .map(|mounts| {
            mounts
                .lines()
                .any(|l| l.split_whitespace().nth(1) == Some("/proc") && l.contains("hidepid="))
        })
        .unwrap_or(false)
}

impl Shortcuts<'_> {
    fn require_pid(&self, token: &str) -> Result<i32> {
        self.registry.find_by_name(token)
    }

    fn monitor(&self, arg: &str, stdin: bool) -> Result<i32> {
        if proc_hidepid() {
            let mut profile = WorkerProfile::hidepid_root();
            if stdin {
                profile = profile.with_stdin();
            }
            self.gate
                .as_root(|_| worker::run(self.identity, profile, paths::PATH_BMON, &[arg]))
        } else {
            let mut profile = WorkerProfile::user();
            if stdin {
                profile = profile.with_stdin();
            }
            worker::run(self.identity, profile, paths::PATH_BMON, &[arg])
        }
    }

    fn record_file(&self, pid: i32, file: &str) -> Result<String> {
        std::fs::read_to_string(
            Path::new(paths::RUN_DIR).join(pid.to_string()).join(file),
        )
        .map_err(|_| Error::config(format!("cannot find sandbox {}", pid)))
    }

    fn join_args(
        &self,
        item: &Item<'_>,
        argv: &[String],
        builder: &PolicyBuilder<'_>,
    ) -> Result<(Option<Vec<String>>, Option<PathBuf>)> {
        let rest = &argv[item.index + 1..];
        if builder.shell_none() {
            if rest.is_empty() {
                return Err(Error::config("--shell=none set, but no command specified"));
            }
            return Ok((Some(rest.to_vec()), None));
        }
        let program = if rest.is_empty() {
            None
        } else {
            Some(rest.to_vec())
        };
        let shell = builder.shell_path().cloned().or_else(guess_shell);
        Ok((program, shell))
    }

    fn bandwidth(&self, target: &str, item: &Item<'_>, argv: &[String]) -> Result<i32> {
        self.conf.require(Feature::Network)?;
        let rest = &argv[item.index + 1..];
        let cmd = rest
            .first()
            .ok_or_else(|| Error::config("command expected after --bandwidth option"))?;
        if !["status", "clear", "set"].contains(&cmd.as_str()) {
            return Err(Error::config(
                "invalid --bandwidth command.\nValid commands: set, clear, status.",
            ));
        }

        let mut helper_args: Vec<String> = vec!["bandwidth".into()];
        let pid = self.require_pid(target)?;
        helper_args.push(pid.to_string());
        helper_args.push(cmd.clone());

        if cmd == "set" || cmd == "clear" {
            let dev = rest.get(1).ok_or_else(|| {
                Error::config(format!("network name expected after --bandwidth {} option", cmd))
            })?;
            if !Path::new("/sys/class/net").join(dev).exists() {
                return Err(Error::config(format!("network device {} not found", dev)));
            }
            helper_args.push(dev.clone());

            if cmd == "set" {
                let down = rest
                    .get(2)
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| Error::config("invalid download speed"))?;
                let up = rest
                    .get(3)
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| Error::config("invalid upload speed"))?;
                helper_args.push(down.to_string());
                helper_args.push(up.to_string());
            }
        }

        let args: Vec<&str> = helper_args.iter().map(String::as_str).collect();
        worker::run(self.identity, WorkerProfile::user(), paths::PATH_BNET, &args)
    }

    fn print_caps(&self, pid: i32) -> Result<i32> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid))
            .map_err(|_| Error::config(format!("cannot find sandbox {}", pid)))?;
        let bnd = status
            .lines()
            .find_map(|l| l.strip_prefix("CapBnd:"))
            .map(str::trim)
            .ok_or_else(|| Error::config("cannot read capability state"))?;
        let mask = u64::from_str_radix(bnd, 16)
            .map_err(|_| Error::config("cannot read capability state"))?;
        for (i, name) in caps::all_names().iter().enumerate() {
            let state = if mask & (1 << i) != 0 { "enabled" } else { "disabled" };
            println!("{:<24} - {}", name, state);
        }
        Ok(0)
    }

    pub fn dispatch(
        &self,
        item: &Item<'_>,
        argv: &[String],
        builder: &PolicyBuilder<'_>,
    ) -> Result<Option<i32>> {
        let handled = match item.token {
            Token::Flag("help") | Token::Other("-?") => {
                usage();
                Some(0)
            }
            Token::Flag("version") => {
                println!("burrow version {}", VERSION);
                Some(0)
            }

            Token::Flag("debug-caps") => {
                for name in caps::all_names() {
                    println!("{}", name);
                }
                Some(0)
            }
            Token::Flag("debug-syscalls") => {
                self.conf.require(Feature::Seccomp)?;
                Some(worker::run(
                    self.identity,
                    WorkerProfile::user(),
                    paths::PATH_FSEC,
                    &["debug-syscalls"],
                )?)
            }
            Token::Flag("debug-errnos") => {
                self.conf.require(Feature::Seccomp)?;
                Some(worker::run(
                    self.identity,
                    WorkerProfile::user(),
                    paths::PATH_FSEC,
                    &["debug-errnos"],
                )?)
            }
            Token::Flag("debug-protocols") => Some(worker::run(
                self.identity,
                WorkerProfile::user(),
                paths::PATH_FSEC,
                &["debug-protocols"],
            )?),

            Token::Flag("list") => Some(self.monitor("--list", false)?),
            Token::Flag("tree") => Some(self.monitor("--tree", false)?),
            Token::Flag("top") => Some(self.monitor("--top", true)?),
            Token::Flag("netstats") => {
                self.conf.require(Feature::Network)?;
                Some(self.monitor("--netstats", true)?)
            }

            Token::Valued {
                name: "bandwidth",
                value,
            } => Some(self.bandwidth(value, item, argv)?),

            Token::Valued {
                name: "netfilter.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                print!("{}", self.record_file(pid, "netfilter")?);
                Some(0)
            }
            Token::Valued {
                name: "netfilter6.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                print!("{}", self.record_file(pid, "netfilter6")?);
                Some(0)
            }

            Token::Valued {
                name: "seccomp.print",
                value,
            } => {
                self.conf.require(Feature::Seccomp)?;
                let pid = self.require_pid(value)?;
                Some(worker::run(
                    self.identity,
                    WorkerProfile::user(),
                    paths::PATH_FSEC,
                    &["print", &pid.to_string()],
                )?)
            }
            Token::Valued {
                name: "protocol.print",
                value,
            } => {
                self.conf.require(Feature::Seccomp)?;
                let pid = self.require_pid(value)?;
                let snapshot = self.registry.read_profile(pid)?;
                for line in snapshot.lines().filter(|l| l.starts_with("protocol")) {
                    println!("{}", line);
                }
                Some(0)
            }
            Token::Valued {
                name: "profile.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                print!("{}", self.registry.read_profile(pid)?);
                Some(0)
            }
            Token::Valued {
                name: "apparmor.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                Some(worker::run(
                    self.identity,
                    WorkerProfile::user(),
                    paths::PATH_BMON,
                    &["--apparmor", &pid.to_string()],
                )?)
            }
            Token::Valued {
                name: "caps.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                Some(self.print_caps(pid)?)
            }
            Token::Valued {
                name: "fs.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                print!("{}", self.record_file(pid, "fslog")?);
                Some(0)
            }
            Token::Valued {
                name: "dns.print",
                value,
            } => {
                let pid = self.require_pid(value)?;
                let net = self.registry.read_netmap(pid)?;
                for dns in &net.dns {
                    println!("{}", dns);
                }
                Some(0)
            }

            Token::Valued {
                name: "join",
                value,
            } => {
                if !self.identity.uid.is_root() {
                    self.conf.require(Feature::Join)?;
                }
                let (program, shell) = self.join_args(item, argv, builder)?;
                Some(join::join(
                    self.gate,
                    self.registry,
                    self.identity,
                    JoinScope::All,
                    value,
                    program,
                    shell,
                )?)
            }
            Token::Valued {
                name: "join-or-start",
                value,
            } => {
                // join by name if such a sandbox exists; otherwise fall
                // through and start one
                match self.registry.find_by_name(value) {
                    Ok(pid) if Path::new("/proc").join(pid.to_string()).exists() => {
                        let (program, shell) = self.join_args(item, argv, builder)?;
                        Some(join::join(
                            self.gate,
                            self.registry,
                            self.identity,
                            JoinScope::All,
                            value,
                            program,
                            shell,
                        )?)
                    }
                    _ => None,
                }
            }
            Token::Valued {
                name: "join-network",
                value,
            } => {
                self.conf.require(Feature::Network)?;
                if !self.identity.uid.is_root() {
                    return Err(Error::auth(
                        "--join-network is only available to root user",
                    ));
                }
                let (program, shell) = self.join_args(item, argv, builder)?;
                Some(join::join(
                    self.gate,
                    self.registry,
                    self.identity,
                    JoinScope::Network,
                    value,
                    program,
                    shell,
                )?)
            }
            Token::Valued {
                name: "join-filesystem",
                value,
            } => {
                if !self.identity.uid.is_root() {
                    return Err(Error::auth(
                        "--join-filesystem is only available to root user",
                    ));
                }
                let (program, shell) = self.join_args(item, argv, builder)?;
                Some(join::join(
                    self.gate,
                    self.registry,
                    self.identity,
                    JoinScope::Filesystem,
                    value,
                    program,
                    shell,
                )?)
            }
            Token::Valued {
                name: "shutdown",
                value,
            } => Some(join::shutdown(self.gate, self.registry, value)?),

            _ => None,
        };
        Ok(handled)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arglex;

    // the target of a *.print option is the full text after '=', never a
    // fixed-offset slice of the raw argument
    #[test]
    fn apparmor_print_target() {
        let argv: Vec<String> = vec!["burrow".into(), "--apparmor.print=mybox".into()];
        let lexed = arglex::lex(&argv).unwrap();
        match lexed.items[0].token {
            Token::Valued { name, value } => {
                assert_eq!(name, "apparmor.print");
                assert_eq!(value, "mybox");
            }
            _ => panic!("expected valued token"),
        }
    }

    #[test]
    fn hidepid_detection_parses_mounts() {
        // whatever the host says, it must not panic
        let _ = proc_hidepid();
    }
}
