use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};

// shells in order of preference
const SHELLS: &[&str] = &["/bin/bash", "/bin/csh", "/usr/bin/zsh", "/bin/sh", "/bin/ash"];

// access(2) checks as the real uid, which is what we want for a set-uid
// binary: the *invoking* user must be able to read the shell
fn readable(path: &Path) -> bool {
    access(path, AccessFlags::R_OK).is_ok()
}

pub fn guess_shell() -> Option<PathBuf> {
    if let Ok(shell) = std::env::var("SHELL") {
        let path = PathBuf::from(&shell);
        if readable(&path) {
            return Some(path);
        }
    }

    SHELLS
        .iter()
        .map(PathBuf::from)
        .find(|p| readable(p))
}

#[cfg(test)]
mod test {
    use super::*;

    // one test because SHELL is process-global and tests run in parallel
    #[test]
    fn resolution_order() {
        // /bin/sh exists on any Linux we run tests on
        std::env::remove_var("SHELL");
        let shell = guess_shell().unwrap();
        assert!(readable(&shell));

        std::env::set_var("SHELL", "/bin/sh");
        assert_eq!(guess_shell().unwrap(), PathBuf::from("/bin/sh"));

        std::env::set_var("SHELL", "/nonexistent/shell");
        let shell = guess_shell().unwrap();
        assert_ne!(shell, PathBuf::from("/nonexistent/shell"));
        std::env::remove_var("SHELL");
    }
}
