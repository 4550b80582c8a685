use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;

use nix::unistd::{geteuid, getgid, getuid, seteuid, Gid, Uid, User};
use tracing::trace;

use crate::error::{Ctx, Error, Result};
use crate::paths;

// The binary is installed set-uid root: real uid = invoking user, saved
// uid = 0. The gate drops the effective uid to the user at startup and
// raises it back to root only inside as_root(). Privileged operations take
// the token parameter so the escalation points are visible in signatures.
pub struct IdentityGate {
    user: Uid,
}

#[derive(Clone, Copy)]
pub struct RootToken<'g> {
    _gate: PhantomData<&'g IdentityGate>,
}

#[cfg(test)]
pub(crate) fn test_token() -> RootToken<'static> {
    RootToken { _gate: PhantomData }
}

impl IdentityGate {
    // drop privileges; they are raised again only when required
    pub fn init() -> Result<Self> {
        let user = getuid();
        seteuid(user).ctx("seteuid")?;
        Ok(IdentityGate { user })
    }

    // nesting is fine: the guard restores whatever euid was current on entry
    pub fn as_root<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(RootToken<'_>) -> Result<T>,
    {
        let prev = geteuid();
        seteuid(Uid::from_raw(0)).ctx("seteuid")?;
        let _restore = scopeguard::guard((), move |_| {
            if seteuid(prev).is_err() {
                // cannot continue with the wrong identity
                std::process::abort();
            }
        });
        f(RootToken { _gate: PhantomData })
    }

    pub fn as_user<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let prev = geteuid();
        seteuid(self.user).ctx("seteuid")?;
        let _restore = scopeguard::guard((), move |_| {
            if seteuid(prev).is_err() {
                std::process::abort();
            }
        });
        f()
    }

    pub fn assert_user(&self) {
        assert_eq!(geteuid(), self.user, "effective uid is not the user");
    }

    pub fn assert_root(&self) {
        assert!(geteuid().is_root(), "effective uid is not root");
    }
}

// the invoking user, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
    pub cwd: PathBuf,
}

pub fn resolve(gate: &IdentityGate) -> Result<Identity> {
    // raised lookup: some hardened kernels hide the passwd backend otherwise
    let pw = gate.as_root(|_| {
        User::from_uid(getuid()).ctx("getpwuid")
    })?;
    let pw = pw.ok_or_else(|| Error::config("cannot resolve the current user"))?;

    if pw.dir.as_os_str().is_empty() {
        return Err(Error::config(format!(
            "user {} doesn't have a user directory assigned",
            pw.name
        )));
    }

    let cwd = std::env::current_dir().ctx("getcwd")?;
    trace!(user = %pw.name, home = %pw.dir.display(), "resolved identity");

    Ok(Identity {
        username: pw.name,
        uid: getuid(),
        gid: getgid(),
        home: pw.dir,
        cwd,
    })
}

// /etc/burrow/burrow.users: one username per line, '#' comments; a missing
// file allows everyone, root is always allowed
pub fn check_allowed(username: &str, uid: Uid) -> Result<()> {
    if uid.is_root() {
        return Ok(());
    }
    let data = match fs::read_to_string(paths::USERS_FILE) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io {
            ctx: paths::USERS_FILE.to_string(),
            err: e,
        }),
    };

    let allowed = data
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .any(|l| l == username);
    if allowed {
        Ok(())
    } else {
        Err(Error::auth(format!(
            "the user is not allowed to use Burrow; add {} to {}",
            username,
            paths::USERS_FILE
        )))
    }
}
