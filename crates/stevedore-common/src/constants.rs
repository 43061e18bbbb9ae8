//! System-wide constants and default names.

/// Compose file names tried, in order, when no file is given explicitly.
pub const DEFAULT_COMPOSE_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Environment variable listing compose files to load.
pub const COMPOSE_FILE_ENV: &str = "COMPOSE_FILE";

/// Environment variable overriding the separator used in [`COMPOSE_FILE_ENV`].
pub const COMPOSE_PATH_SEPARATOR_ENV: &str = "COMPOSE_PATH_SEPARATOR";

/// Environment variable naming the project.
pub const COMPOSE_PROJECT_NAME_ENV: &str = "COMPOSE_PROJECT_NAME";

/// Default separator for [`COMPOSE_FILE_ENV`] path lists.
pub const DEFAULT_PATH_SEPARATOR: &str = ":";

/// Dotenv file read from the project directory for interpolation.
pub const DOTENV_FILE: &str = ".env";

/// The only supported port publication mode.
pub const INGRESS_MODE: &str = "ingress";

/// Default grace period, in seconds, granted to a container on stop.
pub const DEFAULT_STOP_GRACE_SECS: u32 = 10;

/// Default executable used by the Docker backend.
pub const DEFAULT_DOCKER_BINARY: &str = "docker";

/// Label attached to every container and network the backend creates.
pub const PROJECT_LABEL: &str = "io.stevedore.project";

/// Application name used in CLI output and resource names.
pub const APP_NAME: &str = "stevedore";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "stvd";
