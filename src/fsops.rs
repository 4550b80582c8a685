use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use libc::{syscall, SYS_move_mount, SYS_open_tree, AT_FDCWD, OPEN_TREE_CLOEXEC, OPEN_TREE_CLONE};
use nix::mount::{mount, MsFlags};
use tracing::{debug, warn};

use crate::error::{Ctx, Error, Result};
use crate::policy::{FsDirective, Policy};
use crate::sysres;

// musl is missing these
const MOVE_MOUNT_F_EMPTY_PATH: libc::c_uint = 0x00000004;
const AT_RECURSIVE: i32 = 0x8000;

fn mount_common(
    source: Option<&str>,
    dest: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(source, dest, fstype, flags, data).map_err(|err| Error::Sys {
        ctx: format!("mount {}", dest.display()),
        err,
    })
}

fn bind_mount(source: &Path, dest: &Path) -> Result<()> {
    mount(
        Some(source),
        dest,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| Error::Sys {
        ctx: format!("bind {} to {}", source.display(), dest.display()),
        err,
    })
}

fn tmpfs_on(dest: &Path, data: &str) -> Result<()> {
    mount_common(
        Some("tmpfs"),
        dest,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(data),
    )
}

// flag edit on an existing mount point
fn remount(dest: &Path, extra: MsFlags) -> Result<()> {
    // the path may not be a mount point yet
    bind_mount(dest, dest)?;
    mount_common(
        None,
        dest,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_REC | extra,
        None,
    )
}

fn remount_ro(dest: &Path) -> Result<()> {
    remount(dest, MsFlags::MS_RDONLY)
}

// detached clone of a subtree, reattached later with move_mount; this is
// how whitelisted paths survive the tmpfs that covers their parent
fn open_tree(path: &Path) -> Result<OwnedFd> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::config(format!("invalid file name {}", path.display())))?;
    let fd = unsafe {
        sysres(syscall(
            SYS_open_tree,
            AT_FDCWD,
            cpath.as_ptr(),
            OPEN_TREE_CLONE | OPEN_TREE_CLOEXEC | AT_RECURSIVE as u32,
        ))
        .ctx("open_tree")?
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn move_mount_to(fd: &OwnedFd, dest: &Path) -> Result<()> {
    let cdest = CString::new(dest.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::config(format!("invalid file name {}", dest.display())))?;
    unsafe {
        sysres(syscall(
            SYS_move_mount,
            fd.as_raw_fd(),
            c"".as_ptr(),
            AT_FDCWD,
            cdest.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH,
        ))
        .ctx("move_mount")?;
    }
    Ok(())
}

fn blacklist(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => {
            debug!(path = %path.display(), "blacklist target does not exist");
            return Ok(());
        }
    };
    if meta.is_dir() {
        tmpfs_on(path, "mode=755")?;
        remount_ro(path)
    } else {
        bind_mount(Path::new("/dev/null"), path)
    }
}

// noblacklist/nowhitelist drop earlier matching intents; the rest keeps
// its accumulation order
fn effective(directives: &[FsDirective]) -> Vec<FsDirective> {
    let mut out: Vec<FsDirective> = Vec::new();
    for d in directives {
        match d {
            FsDirective::Noblacklist(p) => {
                out.retain(|e| !matches!(e, FsDirective::Blacklist(q) if q == p));
            }
            FsDirective::Nowhitelist(p) => {
                out.retain(|e| !matches!(e, FsDirective::Whitelist(q) if q == p));
            }
            other => out.push(other.clone()),
        }
    }
    out
}

// the first path component, or the home directory for paths inside it
fn whitelist_top(path: &Path, home: &Path) -> PathBuf {
    if path.starts_with(home) {
        return home.to_path_buf();
    }
    let mut comps = path.components();
    comps.next(); // RootDir
    match comps.next() {
        Some(c) => Path::new("/").join(c),
        None => PathBuf::from("/"),
    }
}

// cover each top directory with tmpfs, keeping only the whitelisted
// subtrees: clone them first, mount tmpfs, then reattach the clones
fn apply_whitelists(paths: &[PathBuf], policy: &Policy) -> Result<()> {
    let mut groups: BTreeMap<PathBuf, Vec<(PathBuf, OwnedFd, bool)>> = BTreeMap::new();
    for path in paths {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => {
                debug!(path = %path.display(), "whitelist target does not exist");
                continue;
            }
        };
        let top = whitelist_top(path, &policy.identity.home);
        let fd = open_tree(path)?;
        groups
            .entry(top)
            .or_default()
            .push((path.clone(), fd, meta.is_dir()));
    }

    for (top, entries) in &groups {
        let data = if *top == policy.identity.home {
            format!(
                "mode=755,uid={},gid={}",
                policy.identity.uid.as_raw(),
                policy.identity.gid.as_raw()
            )
        } else {
            "mode=755".to_string()
        };
        tmpfs_on(top, &data)?;

        for (path, fd, is_dir) in entries {
            if *is_dir {
                fs::create_dir_all(path).ctx("whitelist mkdir")?;
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).ctx("whitelist mkdir")?;
                }
                fs::File::create(path).ctx("whitelist touch")?;
            }
            move_mount_to(fd, path)?;
        }
    }
    Ok(())
}

const PRIVATE_DEV_KEEP: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

fn private_dev(policy: &Policy) -> Result<()> {
    let mut keep: Vec<&str> = PRIVATE_DEV_KEEP.to_vec();
    if !policy.media.nosound {
        keep.push("/dev/snd");
    }
    if !policy.media.no3d {
        keep.push("/dev/dri");
    }

    // clone the survivors before tmpfs covers /dev
    let mut stash: Vec<(PathBuf, OwnedFd, bool)> = Vec::new();
    for dev in keep {
        let path = Path::new(dev);
        let Ok(meta) = fs::symlink_metadata(path) else {
            continue;
        };
        stash.push((path.to_path_buf(), open_tree(path)?, meta.is_dir()));
    }

    tmpfs_on(Path::new("/dev"), "mode=755")?;
    for (path, fd, is_dir) in &stash {
        if *is_dir {
            fs::create_dir_all(path).ctx("mkdir dev entry")?;
        } else {
            fs::File::create(path).ctx("touch dev entry")?;
        }
        move_mount_to(fd, path)?;
    }

    fs::create_dir_all("/dev/shm").ctx("mkdir /dev/shm")?;
    tmpfs_on(Path::new("/dev/shm"), "mode=1777")?;
    fs::create_dir_all("/dev/pts").ctx("mkdir /dev/pts")?;
    mount_common(
        Some("devpts"),
        Path::new("/dev/pts"),
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=620"),
    )?;
    Ok(())
}

// media devices are hidden individually when /dev is otherwise shared
fn media_blacklists(policy: &Policy) -> Result<()> {
    if policy.media.nosound {
        blacklist(Path::new("/dev/snd"))?;
    }
    if policy.media.no3d {
        blacklist(Path::new("/dev/dri"))?;
    }
    if policy.media.notv {
        blacklist(Path::new("/dev/dvb"))?;
    }
    if policy.media.nodvd {
        blacklist(Path::new("/dev/sr0"))?;
    }
    Ok(())
}

const BASIC_RO: &[&str] = &["/bin", "/sbin", "/lib", "/lib32", "/lib64", "/usr"];

// the child's view of the filesystem, applied after the mount namespace
// went private; application order is accumulation order
pub fn apply(policy: &Policy) -> Result<()> {
    // system directories are read-only unless a writable-* toggle says
    // otherwise
    for dir in BASIC_RO {
        let path = Path::new(dir);
        if path.is_dir() {
            remount_ro(path)?;
        }
    }
    if !policy.writable_etc && Path::new("/etc").is_dir() {
        remount_ro(Path::new("/etc"))?;
    }
    if !policy.writable_var && Path::new("/var").is_dir() {
        remount_ro(Path::new("/var"))?;
    }
    if !policy.keep_var_tmp && Path::new("/var/tmp").is_dir() {
        tmpfs_on(Path::new("/var/tmp"), "mode=1777")?;
    }
    if !policy.writable_var_log && Path::new("/var/log").is_dir() {
        tmpfs_on(Path::new("/var/log"), "mode=755")?;
    }
    if !policy.writable_run_user && Path::new("/run/user").is_dir() {
        remount_ro(Path::new("/run/user"))?;
    }

    if policy.private {
        match &policy.private_dir {
            Some(dir) => bind_mount(dir, &policy.identity.home)?,
            None => {
                let data = format!(
                    "mode=755,uid={},gid={}",
                    policy.identity.uid.as_raw(),
                    policy.identity.gid.as_raw()
                );
                tmpfs_on(&policy.identity.home, &data)?;
            }
        }
    }
    if policy.private_tmp {
        tmpfs_on(Path::new("/tmp"), "mode=1777")?;
    }
    if policy.private_cache {
        let cache = policy.identity.home.join(".cache");
        if cache.is_dir() {
            let data = format!(
                "mode=700,uid={},gid={}",
                policy.identity.uid.as_raw(),
                policy.identity.gid.as_raw()
            );
            tmpfs_on(&cache, &data)?;
        }
    }

    if policy.private_dev {
        private_dev(policy)?;
    } else {
        media_blacklists(policy)?;
    }

    if policy.disable_mnt {
        for dir in ["/mnt", "/media", "/run/mount", "/run/media"] {
            blacklist(Path::new(dir))?;
        }
    }

    let directives = effective(&policy.fs);
    let whitelists: Vec<PathBuf> = directives
        .iter()
        .filter_map(|d| match d {
            FsDirective::Whitelist(p) => Some(p.clone()),
            _ => None,
        })
        .collect();

    for directive in &directives {
        match directive {
            FsDirective::Bind { src, dst } => bind_mount(src, dst)?,
            FsDirective::Tmpfs(path) => tmpfs_on(path, "mode=755")?,
            FsDirective::Blacklist(path) => blacklist(path)?,
            FsDirective::ReadOnly(path) => remount_ro(path)?,
            FsDirective::ReadWrite(path) => remount(path, MsFlags::empty())?,
            FsDirective::Noexec(path) => remount(path, MsFlags::MS_NOEXEC)?,
            // handled as a batch below
            FsDirective::Whitelist(_) => {}
            FsDirective::Noblacklist(_) | FsDirective::Nowhitelist(_) => unreachable!(),
        }
    }

    if !whitelists.is_empty() {
        apply_whitelists(&whitelists, policy)?;
    }

    if let Some(hosts) = &policy.network.hosts_file {
        if Path::new("/etc/hosts").exists() {
            bind_mount(hosts, Path::new("/etc/hosts"))?;
        } else {
            warn!("no /etc/hosts to override");
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn noblacklist_cancels_earlier_blacklist() {
        let input = vec![
            FsDirective::Blacklist("/usr/share".into()),
            FsDirective::Blacklist("/opt".into()),
            FsDirective::Noblacklist("/usr/share".into()),
            FsDirective::Tmpfs("/tmp/x".into()),
        ];
        assert_eq!(
            effective(&input),
            vec![
                FsDirective::Blacklist("/opt".into()),
                FsDirective::Tmpfs("/tmp/x".into()),
            ]
        );
    }

    #[test]
    fn nowhitelist_cancels_only_matching() {
        let input = vec![
            FsDirective::Whitelist("/home/tester/a".into()),
            FsDirective::Whitelist("/home/tester/b".into()),
            FsDirective::Nowhitelist("/home/tester/a".into()),
        ];
        assert_eq!(
            effective(&input),
            vec![FsDirective::Whitelist("/home/tester/b".into())]
        );
    }

    #[test]
    fn whitelist_top_grouping() {
        let home = Path::new("/home/tester");
        assert_eq!(
            whitelist_top(Path::new("/home/tester/.config/app"), home),
            PathBuf::from("/home/tester")
        );
        assert_eq!(
            whitelist_top(Path::new("/tmp/scratch"), home),
            PathBuf::from("/tmp")
        );
        assert_eq!(
            whitelist_top(Path::new("/srv/data/x"), home),
            PathBuf::from("/srv")
        );
    }
}
