use std::io;

pub type Result<T> = std::result::Result<T, Error>;

// launcher error taxonomy; everything pre-fork is reported once at the top
// as "Error: <msg>" and exits 1
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // mutually-exclusive flags, capacity exceeded, malformed values
    #[error("{0}")]
    Config(String),
    // profile file not found or directive rejected
    #[error("{0}")]
    Policy(String),
    // user not in allow-list, privileged flag without root
    #[error("{0}")]
    Auth(String),
    #[error("{ctx}: {err}")]
    Sys {
        ctx: String,
        #[source]
        err: nix::Error,
    },
    #[error("{ctx}: {err}")]
    Io {
        ctx: String,
        #[source]
        err: io::Error,
    },
    // the child terminated before reaching the program
    #[error("the sandbox terminated during setup")]
    ChildCrash,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Error::Policy(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }
}

pub trait Ctx<T> {
    fn ctx(self, what: &str) -> Result<T>;
}

impl<T> Ctx<T> for nix::Result<T> {
    fn ctx(self, what: &str) -> Result<T> {
        self.map_err(|err| Error::Sys {
            ctx: what.to_string(),
            err,
        })
    }
}

impl<T> Ctx<T> for io::Result<T> {
    fn ctx(self, what: &str) -> Result<T> {
        self.map_err(|err| Error::Io {
            ctx: what.to_string(),
            err,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_renders_bare_message() {
        let e = Error::config("--net=none and --interface are incompatible");
        assert_eq!(
            e.to_string(),
            "--net=none and --interface are incompatible"
        );
    }

    #[test]
    fn sys_carries_context() {
        let e: Result<()> = Err(nix::Error::EPERM).ctx("clone");
        assert!(e.unwrap_err().to_string().starts_with("clone: "));
    }
}
