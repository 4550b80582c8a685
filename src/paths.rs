// runtime + config locations, fixed at build time

pub const RUN_DIR: &str = "/run/burrow";

pub const SYSCONF_DIR: &str = "/etc/burrow";
pub const CONFIG_FILE: &str = "/etc/burrow/burrow.config";
pub const USERS_FILE: &str = "/etc/burrow/burrow.users";

// helper binaries, invoked through the subprocess gateway
pub const PATH_FSEC: &str = "/usr/lib/burrow/fsec"; // seccomp filter builder
pub const PATH_BMON: &str = "/usr/lib/burrow/bmon"; // sandbox monitor
pub const PATH_BNET: &str = "/usr/lib/burrow/bnet"; // bandwidth shaper

// nested-sandbox marker, set for the child and checked before sweeping
pub const CONTAINER_ENV: &str = "container";
pub const CONTAINER_NAME: &str = "burrow";
