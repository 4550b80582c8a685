use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths;

// run-time feature gates, /etc/burrow/burrow.config
// one "key yes|no" pair per line, '#' comments
#[derive(Debug, Clone)]
pub struct FeatureConf {
    pub seccomp: bool,
    pub network: bool,
    pub restricted_network: bool,
    pub bind: bool,
    pub whitelist: bool,
    pub join: bool,
    pub userns: bool,
    pub force_nonewprivs: bool,
}

impl Default for FeatureConf {
    fn default() -> Self {
        FeatureConf {
            seccomp: true,
            network: true,
            restricted_network: false,
            bind: true,
            whitelist: true,
            join: true,
            userns: true,
            force_nonewprivs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Seccomp,
    Network,
    Bind,
    Whitelist,
    Join,
    UserNs,
}

impl Feature {
    fn name(self) -> &'static str {
        match self {
            Feature::Seccomp => "seccomp",
            Feature::Network => "networking",
            Feature::Bind => "bind",
            Feature::Whitelist => "whitelist",
            Feature::Join => "join",
            Feature::UserNs => "noroot",
        }
    }
}

impl FeatureConf {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(paths::CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut conf = FeatureConf::default();
        let data = match fs::read_to_string(path) {
            Ok(d) => d,
            // no config file means everything at defaults
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(conf),
            Err(e) => {
                return Err(Error::config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut it = line.split_whitespace();
            let key = it.next().unwrap_or("");
            let value = match it.next() {
                Some("yes") => true,
                Some("no") => false,
                _ => {
                    return Err(Error::config(format!(
                        "invalid line {} in {}",
                        lineno + 1,
                        path.display()
                    )))
                }
            };

            match key {
                "seccomp" => conf.seccomp = value,
                "network" => conf.network = value,
                "restricted-network" => conf.restricted_network = value,
                "bind" => conf.bind = value,
                "whitelist" => conf.whitelist = value,
                "join" => conf.join = value,
                "userns" => conf.userns = value,
                "force-nonewprivs" => conf.force_nonewprivs = value,
                _ => {
                    return Err(Error::config(format!(
                        "invalid line {} in {}",
                        lineno + 1,
                        path.display()
                    )))
                }
            }
        }

        Ok(conf)
    }

    fn enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Seccomp => self.seccomp,
            Feature::Network => self.network,
            Feature::Bind => self.bind,
            Feature::Whitelist => self.whitelist,
            Feature::Join => self.join,
            Feature::UserNs => self.userns,
        }
    }

    pub fn require(&self, feature: Feature) -> Result<()> {
        if self.enabled(feature) {
            Ok(())
        } else {
            Err(Error::config(format!(
                "{} feature is disabled in Burrow configuration file",
                feature.name()
            )))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_defaults() {
        let conf = FeatureConf::load_from(Path::new("/nonexistent/burrow.config")).unwrap();
        assert!(conf.seccomp);
        assert!(!conf.restricted_network);
    }

    #[test]
    fn parses_overrides() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "seccomp no").unwrap();
        writeln!(f, "restricted-network yes").unwrap();
        let conf = FeatureConf::load_from(f.path()).unwrap();
        assert!(!conf.seccomp);
        assert!(conf.restricted_network);
        assert!(conf.require(Feature::Seccomp).is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "frobnicate yes").unwrap();
        assert!(FeatureConf::load_from(f.path()).is_err());
    }

    #[test]
    fn disabled_feature_message() {
        let conf = FeatureConf {
            network: false,
            ..Default::default()
        };
        let err = conf.require(Feature::Network).unwrap_err();
        assert_eq!(
            err.to_string(),
            "networking feature is disabled in Burrow configuration file"
        );
    }
}
