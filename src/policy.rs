use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::arglex::{Item, Token};
use crate::caps::{self, CapsPolicy};
use crate::conf::{Feature, FeatureConf};
use crate::envstore::EnvStore;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::netconf::NetworkConfig;
use crate::profile;
use crate::shell::guess_shell;

pub const MAX_IGNORE: usize = 4;

// ordered filesystem intents; application order = accumulation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsDirective {
    Bind { src: PathBuf, dst: PathBuf },
    Tmpfs(PathBuf),
    Blacklist(PathBuf),
    Noblacklist(PathBuf),
    Whitelist(PathBuf),
    Nowhitelist(PathBuf),
    ReadOnly(PathBuf),
    ReadWrite(PathBuf),
    Noexec(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    Shell { path: PathBuf },
    Command { argv: Vec<String> },
    AppImage { path: String, argv: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeccompConfig {
    pub enabled: bool,
    // custom blocklist on top of the default filter
    pub list: Option<String>,
    pub drop: Option<String>,
    pub keep: Option<String>,
    pub block_secondary: bool,
    pub protocol: Option<String>,
    pub mdwx: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaToggles {
    pub nosound: bool,
    pub noautopulse: bool,
    pub novideo: bool,
    pub no3d: bool,
    pub notv: bool,
    pub nodvd: bool,
    pub nou2f: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cli,
    Profile,
}

// the frozen sandbox request; immutable once the pre-fork phase ends
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub identity: Identity,
    pub sandbox_pid: i32,

    pub name: Option<String>,
    pub hostname: Option<String>,

    pub program: Program,
    pub command_name: String,
    pub window_title: String,
    pub command_mode: bool,

    pub fs: Vec<FsDirective>,
    // raw directive snapshot for the run record
    pub profile_entries: Vec<String>,
    pub loaded_profiles: Vec<PathBuf>,

    pub ipc: bool,
    pub seccomp: SeccompConfig,
    pub caps: CapsPolicy,
    pub network: NetworkConfig,
    pub env: EnvStore,

    pub no_new_privs: bool,
    pub noroot: bool,
    pub nogroups: bool,
    pub private: bool,
    pub private_dir: Option<PathBuf>,
    pub private_dev: bool,
    pub private_tmp: bool,
    pub private_cache: bool,
    pub writable_etc: bool,
    pub writable_var: bool,
    pub writable_var_log: bool,
    pub writable_run_user: bool,
    pub keep_var_tmp: bool,
    pub media: MediaToggles,
    pub allusers: bool,
    pub disable_mnt: bool,
    pub apparmor: bool,
    pub appimage: bool,

    pub timeout: Option<u32>,
    pub debug: bool,
    pub quiet: bool,
}

pub struct PolicyBuilder<'a> {
    conf: &'a FeatureConf,
    identity: Identity,
    sandbox_pid: i32,

    name: Option<String>,
    hostname: Option<String>,

    fs: Vec<FsDirective>,
    profile_entries: Vec<String>,
    pub(crate) loaded_profiles: Vec<PathBuf>,
    pub(crate) ignore_patterns: Vec<String>,
    custom_profile: bool,
    noprofile: bool,

    ipc: bool,
    seccomp: SeccompConfig,
    caps_default: bool,
    caps_drop_all: bool,
    caps_drop: Option<u64>,
    caps_keep: Option<u64>,
    network: NetworkConfig,
    env: EnvStore,

    shell: Option<PathBuf>,
    shell_none: bool,
    command_mode: bool,

    no_new_privs: bool,
    noroot: bool,
    nogroups: bool,
    private: bool,
    private_dir: Option<PathBuf>,
    private_dev: bool,
    private_tmp: bool,
    private_cache: bool,
    writable_etc: bool,
    writable_var: bool,
    writable_var_log: bool,
    writable_run_user: bool,
    keep_var_tmp: bool,
    media: MediaToggles,
    allusers: bool,
    disable_mnt: bool,
    apparmor: bool,
    appimage: bool,

    timeout: Option<u32>,
    debug: bool,
    quiet: bool,
}

impl<'a> PolicyBuilder<'a> {
    pub fn new(conf: &'a FeatureConf, identity: Identity, sandbox_pid: i32) -> Self {
        PolicyBuilder {
            conf,
            identity,
            sandbox_pid,
            name: None,
            hostname: None,
            fs: Vec::new(),
            profile_entries: Vec::new(),
            loaded_profiles: Vec::new(),
            ignore_patterns: Vec::new(),
            custom_profile: false,
            noprofile: false,
            ipc: false,
            seccomp: SeccompConfig::default(),
            caps_default: false,
            caps_drop_all: false,
            caps_drop: None,
            caps_keep: None,
            network: NetworkConfig::default(),
            env: EnvStore::default(),
            shell: None,
            shell_none: false,
            command_mode: false,
            no_new_privs: conf.force_nonewprivs,
            noroot: false,
            nogroups: false,
            private: false,
            private_dir: None,
            private_dev: false,
            private_tmp: false,
            private_cache: false,
            writable_etc: false,
            writable_var: false,
            writable_var_log: false,
            writable_run_user: false,
            keep_var_tmp: false,
            media: MediaToggles::default(),
            allusers: false,
            disable_mnt: false,
            apparmor: false,
            appimage: false,
            timeout: None,
            debug: false,
            quiet: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn noprofile(&self) -> bool {
        self.noprofile
    }

    pub fn has_custom_profile(&self) -> bool {
        self.custom_profile
    }

    pub fn mark_custom_profile(&mut self) {
        self.custom_profile = true;
    }

    fn is_root(&self) -> bool {
        self.identity.uid.is_root()
    }

    pub fn apply_cli(&mut self, item: &Item<'_>) -> Result<()> {
        match item.token {
            Token::Flag(name) => self.apply(name, None, Source::Cli),
            Token::Valued { name, value } => self.apply(name, Some(value), Source::Cli),
            Token::ShortCommand => {
                self.command_mode = true;
                Ok(())
            }
            Token::Other(raw) => Err(Error::config(format!(
                "invalid {} command line option",
                raw
            ))),
        }
    }

    // one directive, from the CLI surface or a profile line; the grammar is
    // identical apart from the leading "--"
    pub fn apply(&mut self, name: &str, value: Option<&str>, source: Source) -> Result<()> {
        match (name, value) {
            ("debug", None) => {
                if !self.quiet {
                    self.debug = true;
                }
            }
            ("quiet", None) => {
                self.quiet = true;
                self.debug = false;
            }

            // filtering
            ("apparmor", None) => self.apparmor = true,
            ("protocol", Some(list)) => {
                self.conf.require(Feature::Seccomp)?;
                if self.seccomp.protocol.is_some() {
                    warn!(
                        "two protocol lists are present, \"{}\" will be installed",
                        self.seccomp.protocol.as_deref().unwrap()
                    );
                } else {
                    check_protocol_list(list)?;
                    self.seccomp.protocol = Some(list.to_string());
                }
            }
            ("seccomp", None) => {
                self.conf.require(Feature::Seccomp)?;
                self.enable_seccomp()?;
            }
            ("seccomp", Some(list)) => {
                self.conf.require(Feature::Seccomp)?;
                self.enable_seccomp()?;
                self.seccomp.list = Some(check_syscall_list(list)?);
            }
            ("seccomp.drop", Some(list)) => {
                self.conf.require(Feature::Seccomp)?;
                self.enable_seccomp()?;
                self.seccomp.drop = Some(check_syscall_list(list)?);
            }
            ("seccomp.keep", Some(list)) => {
                self.conf.require(Feature::Seccomp)?;
                self.enable_seccomp()?;
                self.seccomp.keep = Some(check_syscall_list(list)?);
            }
            ("seccomp.block-secondary", None) => {
                self.conf.require(Feature::Seccomp)?;
                self.seccomp.block_secondary = true;
            }
            ("memory-deny-write-execute", None) => {
                self.conf.require(Feature::Seccomp)?;
                self.seccomp.mdwx = true;
            }
            ("caps", None) => self.caps_default = true,
            ("caps.drop", Some("all")) => self.caps_drop_all = true,
            ("caps.drop", Some(list)) => self.caps_drop = Some(caps::parse_list(list)?),
            ("caps.keep", Some(list)) => self.caps_keep = Some(caps::parse_list(list)?),
            ("ipc-namespace", None) => self.ipc = true,

            // filesystem
            ("allusers", None) => self.allusers = true,
            ("bind", Some(spec)) => {
                self.conf.require(Feature::Bind)?;
                let (src, dst) = spec
                    .split_once(',')
                    .ok_or_else(|| Error::config("invalid bind option"))?;
                let src = check_path(src)?;
                let dst = check_path(dst)?;
                self.push_fs(FsDirective::Bind { src, dst }, name, spec);
            }
            ("tmpfs", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::Tmpfs(p), name, path);
            }
            ("blacklist", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::Blacklist(p), name, path);
            }
            ("noblacklist", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::Noblacklist(p), name, path);
            }
            ("whitelist", Some(path)) => {
                self.conf.require(Feature::Whitelist)?;
                let p = check_path(path)?;
                self.push_fs(FsDirective::Whitelist(p), name, path);
            }
            ("nowhitelist", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::Nowhitelist(p), name, path);
            }
            ("read-only", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::ReadOnly(p), name, path);
            }
            ("read-write", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::ReadWrite(p), name, path);
            }
            ("noexec", Some(path)) => {
                let p = check_path(path)?;
                self.push_fs(FsDirective::Noexec(p), name, path);
            }
            ("disable-mnt", None) => self.disable_mnt = true,

            ("profile", Some(path)) => {
                // multiple profile files are allowed
                if self.noprofile {
                    return Err(Error::config(
                        "--noprofile and --profile options are mutually exclusive",
                    ));
                }
                let path = profile::expand_home(path, &self.identity.home);
                profile::read_profile(self, Path::new(&path))?;
                self.custom_profile = true;
            }
            ("noprofile", None) => {
                if self.custom_profile {
                    return Err(Error::config(
                        "--profile and --noprofile options are mutually exclusive",
                    ));
                }
                self.noprofile = true;
            }
            ("ignore", Some(pattern)) => {
                if self.custom_profile {
                    return Err(Error::config("please use --profile after --ignore"));
                }
                if pattern.is_empty() {
                    return Err(Error::config("invalid ignore option"));
                }
                if self.ignore_patterns.len() >= MAX_IGNORE {
                    return Err(Error::config(format!(
                        "maximum {} --ignore options are permitted",
                        MAX_IGNORE
                    )));
                }
                self.ignore_patterns.push(pattern.to_string());
            }

            ("writable-etc", None) => self.writable_etc = true,
            ("writable-var", None) => self.writable_var = true,
            ("keep-var-tmp", None) => self.keep_var_tmp = true,
            ("writable-run-user", None) => self.writable_run_user = true,
            ("writable-var-log", None) => self.writable_var_log = true,

            ("private", None) => self.private = true,
            ("private", Some(dir)) => {
                if dir.is_empty() {
                    return Err(Error::config("invalid private option"));
                }
                let dir = PathBuf::from(dir);
                if !dir.is_dir() {
                    return Err(Error::policy(format!(
                        "invalid private directory {}",
                        dir.display()
                    )));
                }
                // plain --private if the directory is the user home
                if dir != self.identity.home {
                    self.private_dir = Some(dir);
                }
                self.private = true;
            }
            ("private-dev", None) => self.private_dev = true,
            ("private-tmp", None) => self.private_tmp = true,
            ("private-cache", None) => self.private_cache = true,

            // hostname, identity
            ("name", Some(n)) => {
                if n.is_empty() {
                    return Err(Error::config("please provide a name for sandbox"));
                }
                self.name = Some(n.to_string());
            }
            ("hostname", Some(h)) => {
                if h.is_empty() {
                    return Err(Error::config("please provide a hostname for sandbox"));
                }
                self.hostname = Some(h.to_string());
            }
            ("nogroups", None) => self.nogroups = true,
            ("noroot", None) => {
                self.conf.require(Feature::UserNs)?;
                self.set_noroot();
            }
            ("nonewprivs", None) => self.no_new_privs = true,
            ("env", Some(kv)) => self.env.set(kv)?,
            ("rmenv", Some(k)) => self.env.rm(k)?,
            ("nosound", None) => self.media.nosound = true,
            ("noautopulse", None) => self.media.noautopulse = true,
            ("novideo", None) => self.media.novideo = true,
            ("no3d", None) => self.media.no3d = true,
            ("notv", None) => self.media.notv = true,
            ("nodvd", None) => self.media.nodvd = true,
            ("nou2f", None) => self.media.nou2f = true,

            // network
            ("interface", Some(dev)) => {
                self.conf.require(Feature::Network)?;
                if self.network.none {
                    return Err(Error::config(
                        "--net=none and --interface are incompatible",
                    ));
                }
                if !self.is_root() {
                    return Err(Error::auth("--interface is allowed only to root user"));
                }
                if dev != "lo" && !Path::new("/sys/class/net").join(dev).exists() {
                    return Err(Error::config(format!("cannot find interface {}", dev)));
                }
                self.network.add_interface(dev)?;
            }
            ("net", Some("none")) => {
                self.conf.require(Feature::Network)?;
                self.network.set_none();
            }
            ("net", Some(dev)) => {
                self.conf.require(Feature::Network)?;
                if self.conf.restricted_network && !self.is_root() {
                    return Err(Error::auth(
                        "only --net=none is allowed to non-root users",
                    ));
                }
                if dev != "lo" && !Path::new("/sys/class/net").join(dev).exists() {
                    return Err(Error::config(format!("cannot find network device {}", dev)));
                }
                self.network.add_bridge(dev)?;
            }
            ("veth-name", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.last_bridge_mut()?.set_veth_name(v)?;
            }
            ("scan", None) => {
                self.conf.require(Feature::Network)?;
                self.network.scan = true;
            }
            ("iprange", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.last_bridge_mut()?.set_iprange(v)?;
            }
            ("mac", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.last_bridge_mut()?.set_mac(v)?;
            }
            ("mtu", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.last_bridge_mut()?.set_mtu(v)?;
            }
            ("ip", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.last_bridge_mut()?.set_ip(v)?;
            }
            ("ip6", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.last_bridge_mut()?.set_ip6(v)?;
            }
            ("defaultgw", Some(v)) => {
                self.conf.require(Feature::Network)?;
                self.network.set_default_gw(v)?;
            }
            ("dns", Some(v)) => self.network.add_dns(v)?,
            ("hosts-file", Some(path)) => {
                let p = check_path(path)?;
                if !p.is_file() {
                    return Err(Error::policy(format!(
                        "hosts file {} not available",
                        p.display()
                    )));
                }
                self.network.hosts_file = Some(p);
            }
            ("netfilter", None) => {
                if !self.is_root() {
                    return Err(Error::auth("--netfilter is only allowed for root"));
                }
                self.conf.require(Feature::Network)?;
                self.network.netfilter = true;
            }
            ("netfilter", Some(file)) => {
                if !self.is_root() {
                    return Err(Error::auth("--netfilter is only allowed for root"));
                }
                self.conf.require(Feature::Network)?;
                self.network.netfilter = true;
                self.network.netfilter_file = Some(check_filter_file(file)?);
            }
            ("netfilter6", Some(file)) => {
                self.conf.require(Feature::Network)?;
                self.network.netfilter6_file = Some(check_filter_file(file)?);
            }
            ("netns", Some(nsname)) => {
                self.conf.require(Feature::Network)?;
                if !Path::new("/run/netns").join(nsname).exists() {
                    return Err(Error::config(format!(
                        "cannot find network namespace {}",
                        nsname
                    )));
                }
                self.network.netns = Some(nsname.to_string());
            }

            // command
            ("timeout", Some(v)) => self.timeout = Some(parse_timeout(v)?),
            ("appimage", None) => self.appimage = true,
            ("shell", Some("none")) => {
                if self.shell.is_some() {
                    return Err(Error::config("a shell was already specified"));
                }
                self.shell_none = true;
            }
            ("shell", Some(path)) => {
                if self.shell_none {
                    return Err(Error::config("--shell=none was already specified"));
                }
                if self.shell.is_some() {
                    return Err(Error::config("only one user shell can be specified"));
                }
                let p = check_path(path)?;
                if p.is_dir() || path.contains("..") {
                    return Err(Error::config("invalid shell"));
                }
                if nix::unistd::access(&p, nix::unistd::AccessFlags::R_OK).is_err() {
                    return Err(Error::config("cannot access shell file"));
                }
                self.shell = Some(p);
            }
            // second half of --join-or-start: no sandbox to join, so start
            // one under that name
            ("join-or-start", Some(n)) => {
                if n.is_empty() {
                    return Err(Error::config("please provide a name for sandbox"));
                }
                self.name = Some(n.to_string());
            }

            (name, _) if source == Source::Profile => {
                return Err(Error::policy(format!("invalid profile directive: {}", name)));
            }
            (name, _) => {
                return Err(Error::config(format!(
                    "invalid --{} command line option",
                    name
                )));
            }
        }
        Ok(())
    }

    fn enable_seccomp(&mut self) -> Result<()> {
        if self.seccomp.enabled {
            return Err(Error::config("seccomp already enabled"));
        }
        self.seccomp.enabled = true;
        Ok(())
    }

    fn set_noroot(&mut self) {
        if self.is_root() {
            warn!("noroot option is not available");
            return;
        }
        // needs kernel user namespace support
        if !Path::new("/proc/self/ns/user").exists() {
            warn!("noroot option is not available");
            return;
        }
        self.noroot = true;
    }

    fn push_fs(&mut self, directive: FsDirective, name: &str, value: &str) {
        self.fs.push(directive);
        self.profile_entries.push(format!("{} {}", name, value));
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }

    pub fn shell_none(&self) -> bool {
        self.shell_none
    }

    pub fn shell_path(&self) -> Option<&PathBuf> {
        self.shell.as_ref()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    // the profile search needs the command name before the policy freezes;
    // resolving it also settles the shell choice
    pub fn resolve_command_name(&mut self, program_argv: Option<&[String]>) -> Result<String> {
        if program_argv.is_none() && self.shell_none {
            return Err(Error::config(
                "shell=none configured, but no program specified",
            ));
        }

        if !self.shell_none && self.shell.is_none() {
            self.shell = Some(guess_shell().ok_or_else(|| {
                Error::config(
                    "unable to guess your shell, please set explicitly by using --shell option",
                )
            })?);
        }

        Ok(match program_argv {
            None => self.shell.as_ref().unwrap().display().to_string(),
            Some(argv) => {
                if self.appimage {
                    argv[0].clone()
                } else {
                    crate::profile::command_basename(&argv[0])
                }
            }
        })
    }

    // freeze; program_argv is everything after the option surface
    pub fn finish(mut self, program_argv: Option<Vec<String>>) -> Result<Policy> {
        let command_name = self.resolve_command_name(program_argv.as_deref())?;

        // block-secondary alone still wants the filter machinery
        if self.seccomp.block_secondary {
            self.seccomp.enabled = true;
        }

        let (program, window_title) = match program_argv {
            None => {
                let shell = self.shell.clone().unwrap();
                let display = shell.display().to_string();
                (Program::Shell { path: shell }, display)
            }
            Some(argv) => {
                let joined = argv.join(" ");
                if self.appimage {
                    // the shell is never used for appimages
                    self.shell_none = false;
                    (
                        Program::AppImage {
                            path: argv[0].clone(),
                            argv: argv[1..].to_vec(),
                        },
                        joined,
                    )
                } else {
                    (Program::Command { argv }, joined)
                }
            }
        };
        debug!(command = %command_name, "sandbox command");

        if self.network.default_gw.is_some() && !self.network.any_bridge() {
            return Err(Error::config(
                "option --defaultgw requires a network device",
            ));
        }

        let caps = if self.caps_drop_all {
            CapsPolicy::DropAll
        } else if let Some(keep) = self.caps_keep {
            CapsPolicy::Keep(keep)
        } else if let Some(drop) = self.caps_drop {
            CapsPolicy::Drop(drop)
        } else if self.caps_default {
            CapsPolicy::DefaultFilter
        } else {
            CapsPolicy::Unchanged
        };

        Ok(Policy {
            identity: self.identity,
            sandbox_pid: self.sandbox_pid,
            name: self.name,
            hostname: self.hostname,
            program,
            command_name,
            window_title,
            command_mode: self.command_mode,
            fs: self.fs,
            profile_entries: self.profile_entries,
            loaded_profiles: self.loaded_profiles,
            ipc: self.ipc,
            seccomp: self.seccomp,
            caps,
            network: self.network,
            env: self.env,
            no_new_privs: self.no_new_privs,
            noroot: self.noroot,
            nogroups: self.nogroups,
            private: self.private,
            private_dir: self.private_dir,
            private_dev: self.private_dev,
            private_tmp: self.private_tmp,
            private_cache: self.private_cache,
            writable_etc: self.writable_etc,
            writable_var: self.writable_var,
            writable_var_log: self.writable_var_log,
            writable_run_user: self.writable_run_user,
            keep_var_tmp: self.keep_var_tmp,
            media: self.media,
            allusers: self.allusers,
            disable_mnt: self.disable_mnt,
            apparmor: self.apparmor,
            appimage: self.appimage,
            timeout: self.timeout,
            debug: self.debug,
            quiet: self.quiet,
        })
    }
}

fn check_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::config("invalid empty file name"));
    }
    if path.bytes().any(|b| b.is_ascii_control()) {
        return Err(Error::config(format!("invalid file name {}", path)));
    }
    Ok(PathBuf::from(path))
}

fn check_filter_file(file: &str) -> Result<PathBuf> {
    let p = check_path(file)?;
    if !p.is_file() {
        return Err(Error::policy(format!(
            "netfilter file {} not available",
            p.display()
        )));
    }
    Ok(p)
}

// syscall names are validated for shape only; the filter builder resolves
// them against the syscall table for the target architecture
fn check_syscall_list(list: &str) -> Result<String> {
    for tok in list.split(',') {
        if tok.is_empty()
            || !tok
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(Error::config("invalid syscall list"));
        }
    }
    Ok(list.to_string())
}

const PROTOCOLS: &[&str] = &["unix", "inet", "inet6", "netlink", "packet"];

fn check_protocol_list(list: &str) -> Result<()> {
    for tok in list.split(',') {
        if !PROTOCOLS.contains(&tok) {
            return Err(Error::config(format!("invalid protocol {}", tok)));
        }
    }
    Ok(())
}

// hh:mm:ss
pub fn parse_timeout(value: &str) -> Result<u32> {
    let invalid = || Error::config("invalid timeout format, please use --timeout=hh:mm:ss");
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let h = parts[0].parse::<u32>().map_err(|_| invalid())?;
    let m = parts[1].parse::<u32>().map_err(|_| invalid())?;
    let s = parts[2].parse::<u32>().map_err(|_| invalid())?;
    if m > 59 || s > 59 {
        return Err(invalid());
    }
    let total = h * 3600 + m * 60 + s;
    if total == 0 {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arglex;
    use nix::unistd::{Gid, Uid};

    pub(crate) fn test_identity(uid: u32) -> Identity {
        Identity {
            username: "tester".into(),
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(1000),
            home: PathBuf::from("/home/tester"),
            cwd: PathBuf::from("/home/tester"),
        }
    }

    fn build(args: &[&str]) -> Result<Policy> {
        build_as(args, 1000)
    }

    fn build_as(args: &[&str], uid: u32) -> Result<Policy> {
        let conf = FeatureConf::default();
        let argv: Vec<String> = std::iter::once("burrow")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        let lexed = arglex::lex(&argv)?;
        let mut builder = PolicyBuilder::new(&conf, test_identity(uid), 4242);
        for item in &lexed.items {
            builder.apply_cli(item)?;
        }
        let program = lexed
            .program_start
            .map(|i| argv[i..].to_vec());
        builder.finish(program)
    }

    #[test]
    fn scenario_basic_policy() {
        let policy = build(&["--seccomp", "--caps.drop=all", "/bin/echo", "hello"]).unwrap();
        assert!(policy.seccomp.enabled);
        assert_eq!(policy.caps, CapsPolicy::DropAll);
        assert_eq!(
            policy.program,
            Program::Command {
                argv: vec!["/bin/echo".into(), "hello".into()]
            }
        );
        assert_eq!(policy.command_name, "echo");
        assert_eq!(policy.window_title, "/bin/echo hello");
    }

    #[test]
    fn shell_none_requires_program() {
        let err = build(&["--shell=none"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "shell=none configured, but no program specified"
        );
    }

    #[test]
    fn seccomp_twice_is_fatal() {
        let err = build(&["--seccomp", "--seccomp.drop=chmod", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "seccomp already enabled");
        let err = build(&["--seccomp.keep=read", "--seccomp=chmod", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "seccomp already enabled");
    }

    #[test]
    fn block_secondary_implies_seccomp() {
        let policy = build(&["--seccomp.block-secondary", "/bin/true"]).unwrap();
        assert!(policy.seccomp.enabled);
        assert!(policy.seccomp.block_secondary);
    }

    #[test]
    fn net_none_refuses_interface() {
        let err = build_as(&["--net=none", "--interface=eth0", "/bin/true"], 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "--net=none and --interface are incompatible"
        );
    }

    #[test]
    fn interface_requires_root() {
        let err = build(&["--interface=eth0", "/bin/true"]).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(err.to_string(), "--interface is allowed only to root user");
    }

    #[test]
    fn dns_capacity() {
        let err = build(&[
            "--dns=1.1.1.1",
            "--dns=1.0.0.1",
            "--dns=8.8.8.8",
            "--dns=8.8.4.4",
            "--dns=9.9.9.9",
            "/bin/true",
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "up to 4 DNS servers can be specified");
    }

    #[test]
    fn netfilter_requires_root() {
        let err = build(&["--netfilter", "/bin/true"]).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(err.to_string(), "--netfilter is only allowed for root");
    }

    #[test]
    fn noprofile_profile_exclusion() {
        let err = build(&["--noprofile", "--profile=/etc/some.profile", "/bin/true"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "--noprofile and --profile options are mutually exclusive"
        );
    }

    #[test]
    fn shell_exclusion() {
        let err = build(&["--shell=none", "--shell=/bin/sh", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "--shell=none was already specified");
        let err = build(&["--shell=/bin/sh", "--shell=none", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "a shell was already specified");
        let err = build(&["--shell=/bin/sh", "--shell=/bin/bash", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "only one user shell can be specified");
    }

    #[test]
    fn quiet_clears_debug() {
        let policy = build(&["--debug", "--quiet", "/bin/true"]).unwrap();
        assert!(policy.quiet);
        assert!(!policy.debug);
    }

    #[test]
    fn keep_var_tmp_any_position() {
        // regression: the original only honoured this flag in argv[1]
        let policy = build(&["--private-tmp", "--nogroups", "--keep-var-tmp", "/bin/true"])
            .unwrap();
        assert!(policy.keep_var_tmp);
    }

    #[test]
    fn fs_directives_keep_order() {
        let policy = build(&[
            "--blacklist=/usr/share",
            "--tmpfs=/tmp/scratch",
            "--read-only=/home/tester",
            "/bin/true",
        ])
        .unwrap();
        assert_eq!(
            policy.fs,
            vec![
                FsDirective::Blacklist(PathBuf::from("/usr/share")),
                FsDirective::Tmpfs(PathBuf::from("/tmp/scratch")),
                FsDirective::ReadOnly(PathBuf::from("/home/tester")),
            ]
        );
        assert_eq!(
            policy.profile_entries,
            vec![
                "blacklist /usr/share",
                "tmpfs /tmp/scratch",
                "read-only /home/tester"
            ]
        );
    }

    #[test]
    fn bind_needs_two_paths() {
        let err = build(&["--bind=/only-one", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid bind option");
        let policy = build(&["--bind=/a,/b", "/bin/true"]).unwrap();
        assert_eq!(
            policy.fs,
            vec![FsDirective::Bind {
                src: "/a".into(),
                dst: "/b".into()
            }]
        );
    }

    #[test]
    fn ignore_capacity_and_ordering() {
        let err = build(&[
            "--ignore=seccomp",
            "--ignore=caps.drop",
            "--ignore=private",
            "--ignore=tmpfs",
            "--ignore=bind",
            "/bin/true",
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "maximum 4 --ignore options are permitted");
        let err = build(&["--ignore=", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid ignore option");
    }

    #[test]
    fn unknown_option_is_fatal() {
        let err = build(&["--frobnicate", "/bin/true"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid --frobnicate command line option"
        );
        let err = build(&["-x", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid -x command line option");
    }

    #[test]
    fn timeout_format() {
        assert_eq!(parse_timeout("01:02:03").unwrap(), 3723);
        assert!(parse_timeout("10:00").is_err());
        assert!(parse_timeout("00:00:00").is_err());
        assert!(parse_timeout("00:99:00").is_err());
        let policy = build(&["--timeout=00:00:30", "/bin/true"]).unwrap();
        assert_eq!(policy.timeout, Some(30));
    }

    #[test]
    fn default_gw_needs_bridge() {
        let err = build_as(&["--defaultgw=192.168.1.1", "/bin/true"], 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "option --defaultgw requires a network device"
        );
    }

    #[test]
    fn protocol_validation_and_first_wins() {
        let policy = build(&[
            "--protocol=unix,inet",
            "--protocol=netlink",
            "/bin/true",
        ])
        .unwrap();
        assert_eq!(policy.seccomp.protocol.as_deref(), Some("unix,inet"));
        let err = build(&["--protocol=carrier-pigeon", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid protocol carrier-pigeon");
    }

    #[test]
    fn caps_resolution_precedence() {
        let policy = build(&["--caps.drop=all", "--caps", "/bin/true"]).unwrap();
        assert_eq!(policy.caps, CapsPolicy::DropAll);
        let policy = build(&["--caps.keep=chown", "--caps.drop=kill", "/bin/true"]).unwrap();
        assert_eq!(policy.caps, CapsPolicy::Keep(1 << 0));
        let policy = build(&["--caps", "/bin/true"]).unwrap();
        assert_eq!(policy.caps, CapsPolicy::DefaultFilter);
    }

    #[test]
    fn shell_program_defaults_to_shell() {
        // no program vector: the resolved shell becomes the program and the
        // command name
        let policy = build(&["--noprofile"]).unwrap();
        match &policy.program {
            Program::Shell { path } => {
                assert_eq!(policy.command_name, path.display().to_string());
            }
            other => panic!("expected shell program, got {:?}", other),
        }
    }

    #[test]
    fn env_directives_accumulate() {
        let policy = build(&["--env=FOO=bar", "--rmenv=BAZ", "/bin/true"]).unwrap();
        assert_eq!(policy.env.ops().len(), 2);
        let err = build(&["--env=NOEQUALS", "/bin/true"]).unwrap_err();
        assert_eq!(err.to_string(), "invalid --env option");
    }

    #[test]
    fn join_or_start_sets_name() {
        let policy = build(&["--join-or-start=mybox", "/bin/true"]).unwrap();
        assert_eq!(policy.name.as_deref(), Some("mybox"));
    }
}
