use libc::{syscall, SYS_capset, PR_CAPBSET_DROP};

use crate::error::{Ctx, Error, Result};
use crate::sysres;

// capability name table, index = kernel capability number
const NAMES: &[&str] = &[
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

// dropped by the default filter
const DEFAULT_DROP: &[&str] = &[
    "sys_module",
    "sys_rawio",
    "sys_boot",
    "sys_nice",
    "sys_tty_config",
    "syslog",
    "mknod",
    "sys_admin",
];

pub fn index(name: &str) -> Option<u8> {
    NAMES.iter().position(|n| *n == name).map(|i| i as u8)
}

pub fn all_names() -> &'static [&'static str] {
    NAMES
}

pub fn full_set() -> u64 {
    (1u64 << NAMES.len()) - 1
}

// comma-separated capability names, validated against the table
pub fn parse_list(list: &str) -> Result<u64> {
    let mut mask = 0u64;
    for tok in list.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            return Err(Error::config("the capability list is invalid"));
        }
        match index(tok) {
            Some(i) => mask |= 1 << i,
            None => return Err(Error::config(format!("capability {} not found", tok))),
        }
    }
    Ok(mask)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapsPolicy {
    #[default]
    Unchanged,
    DefaultFilter,
    DropAll,
    Drop(u64),
    Keep(u64),
}

impl CapsPolicy {
    // effective keep set; None leaves capabilities untouched
    pub fn resolve(self) -> Option<u64> {
        match self {
            CapsPolicy::Unchanged => None,
            CapsPolicy::DropAll => Some(0),
            CapsPolicy::Keep(keep) => Some(keep),
            CapsPolicy::Drop(drop) => Some(full_set() & !drop),
            CapsPolicy::DefaultFilter => {
                let drop = DEFAULT_DROP
                    .iter()
                    .map(|n| 1u64 << index(n).unwrap())
                    .fold(0, |a, b| a | b);
                Some(full_set() & !drop)
            }
        }
    }
}

/* V3 added in Linux 2.6.26 */
const _LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
struct CapUserData {
    effective_lo: u32,
    permitted_lo: u32,
    inheritable_lo: u32,
    effective_hi: u32,
    permitted_hi: u32,
    inheritable_hi: u32,
}

// set effective/permitted/inheritable in one capset call; shrinking the
// flat sets never needs a privilege, so this also works from pre_exec
// hooks running as the user
pub fn set_flat(mask: u64) -> std::io::Result<()> {
    let hdr = CapUserHeader {
        version: _LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = CapUserData {
        effective_lo: (mask & 0xffff_ffff) as u32,
        permitted_lo: (mask & 0xffff_ffff) as u32,
        inheritable_lo: (mask & 0xffff_ffff) as u32,
        effective_hi: (mask >> 32) as u32,
        permitted_hi: (mask >> 32) as u32,
        inheritable_hi: (mask >> 32) as u32,
    };
    let rv = unsafe {
        syscall(
            SYS_capset,
            &hdr as *const CapUserHeader,
            &data as *const CapUserData,
        )
    };
    if rv == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// install the resolved keep set in the child: shrink the bounding set,
// then set effective/permitted/inheritable in one capset call
pub fn apply_keep(mask: u64) -> Result<()> {
    let num_caps = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ctx("cap_last_cap")?
        .trim_end()
        .parse::<u32>()
        .map_err(|_| Error::config("cannot parse cap_last_cap"))?
        + 1;

    for i in 0..num_caps {
        if mask & (1 << i) == 0 {
            unsafe {
                sysres(libc::prctl(PR_CAPBSET_DROP, i as libc::c_ulong, 0, 0, 0))
                    .ctx("prctl(PR_CAPBSET_DROP)")?;
            }
        }
    }

    set_flat(mask).map_err(|err| Error::Io {
        ctx: "capset".into(),
        err,
    })?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert_eq!(index("chown"), Some(0));
        assert_eq!(index("checkpoint_restore"), Some(40));
        assert_eq!(index("supercow"), None);
    }

    #[test]
    fn parse_list_validates() {
        let mask = parse_list("chown,net_raw").unwrap();
        assert_eq!(mask, (1 << 0) | (1 << 13));
        assert!(parse_list("chown,,kill").is_err());
        let err = parse_list("sys_frobnicate").unwrap_err();
        assert_eq!(err.to_string(), "capability sys_frobnicate not found");
    }

    #[test]
    fn resolution_precedence() {
        assert_eq!(CapsPolicy::Unchanged.resolve(), None);
        assert_eq!(CapsPolicy::DropAll.resolve(), Some(0));
        assert_eq!(CapsPolicy::Keep(0b101).resolve(), Some(0b101));
        assert_eq!(
            CapsPolicy::Drop(1 << 5).resolve(),
            Some(full_set() & !(1 << 5))
        );
        let default = CapsPolicy::DefaultFilter.resolve().unwrap();
        assert_eq!(default & (1 << index("sys_module").unwrap()), 0);
        assert_ne!(default & (1 << index("chown").unwrap()), 0);
    }
}
