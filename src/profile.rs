use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::paths;
use crate::policy::{PolicyBuilder, Source};

pub fn expand_home(value: &str, home: &Path) -> String {
    let home = home.display().to_string();
    let value = if let Some(rest) = value.strip_prefix('~') {
        format!("{}{}", home, rest)
    } else {
        value.to_string()
    };
    value.replace("${HOME}", &home)
}

// a profile line is a CLI flag with the leading "--" removed; both the
// "name=value" and "name value" spellings occur, split at whichever
// separator comes first
fn split_directive(line: &str) -> (&str, Option<&str>) {
    let eq = line.find('=');
    let sp = line.find(char::is_whitespace);
    match (eq, sp) {
        (Some(e), Some(s)) if e < s => (&line[..e], Some(&line[e + 1..])),
        (_, Some(s)) => (&line[..s], Some(line[s + 1..].trim_start())),
        (Some(e), None) => (&line[..e], Some(&line[e + 1..])),
        (None, None) => (line, None),
    }
}

pub fn read_profile(builder: &mut PolicyBuilder<'_>, path: &Path) -> Result<()> {
    let data = fs::read_to_string(path)
        .map_err(|_| Error::policy(format!("cannot access profile file {}", path.display())))?;
    debug!(profile = %path.display(), "reading profile");
    builder.loaded_profiles.push(path.to_path_buf());

    let home = builder.identity().home.clone();
    for (lineno, raw) in data.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // the ignore set filters directives by prefix
        if builder
            .ignore_patterns
            .iter()
            .any(|pat| line.starts_with(pat.as_str()))
        {
            debug!(line, "directive ignored");
            continue;
        }

        let line = expand_home(line, &home);
        let (name, value) = split_directive(&line);
        builder
            .apply(name, value, Source::Profile)
            .map_err(|e| match e {
                Error::Policy(msg) => Error::policy(format!(
                    "{} (line {} in {})",
                    msg,
                    lineno + 1,
                    path.display()
                )),
                other => other,
            })?;
    }

    Ok(())
}

fn try_load(builder: &mut PolicyBuilder<'_>, dir: &Path, name: &str) -> Result<bool> {
    // shell sessions carry the full shell path as command name; that never
    // names a profile
    if name.contains('/') {
        return Ok(false);
    }
    let path = dir.join(format!("{}.profile", name));
    if !path.is_file() {
        return Ok(false);
    }
    read_profile(builder, &path)?;
    Ok(true)
}

// search order: per-command profile in the user dir, then the system dir,
// then default.profile (default-root.profile when invoked by root) in the
// same two places
pub fn autoload_from(
    builder: &mut PolicyBuilder<'_>,
    command_name: &str,
    user_dir: &Path,
    sys_dir: &Path,
) -> Result<()> {
    if builder.noprofile() {
        return Ok(());
    }

    if !builder.has_custom_profile() {
        if try_load(builder, user_dir, command_name)?
            || try_load(builder, sys_dir, command_name)?
        {
            builder.mark_custom_profile();
        }
    }

    if !builder.has_custom_profile() {
        let default_name = if builder.identity().uid.is_root() {
            "default-root"
        } else {
            "default"
        };
        if try_load(builder, user_dir, default_name)? || try_load(builder, sys_dir, default_name)?
        {
            builder.mark_custom_profile();
        } else {
            return Err(Error::policy("no default.profile installed"));
        }
    }

    Ok(())
}

pub fn autoload(builder: &mut PolicyBuilder<'_>, command_name: &str) -> Result<()> {
    let user_dir = builder.identity().home.join(".config/burrow");
    autoload_from(
        builder,
        command_name,
        &user_dir,
        Path::new(paths::SYSCONF_DIR),
    )
}

// strip a directory prefix; the profile is looked up by the bare command
pub fn command_basename(argv0: &str) -> String {
    Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.to_string())
}
