//! Compose project loading.
//!
//! Discovers compose files, interpolates variables from the environment,
//! merges multiple files in order, and normalises the result into a
//! [`Project`].

pub mod interpolate;
pub mod raw;
pub mod words;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use stevedore_common::constants::{
    COMPOSE_FILE_ENV, COMPOSE_PATH_SEPARATOR_ENV, COMPOSE_PROJECT_NAME_ENV,
    DEFAULT_COMPOSE_FILES, DEFAULT_PATH_SEPARATOR, DOTENV_FILE,
};
use stevedore_common::error::{Result, StevedoreError};

use crate::model::Project;

use self::raw::{Normalizer, RawComposeFile};

/// Source of the descriptor set for one run.
pub trait ProjectLoader {
    /// Produces the project to orchestrate.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Loader`] if no valid project can be built.
    fn load(&self) -> Result<Project>;
}

/// Where and how a [`ComposeLoader`] looks for its input.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    working_dir: PathBuf,
    config_files: Vec<PathBuf>,
    project_name: Option<String>,
    discover_default_files: bool,
    use_config_file_env: bool,
    environment: HashMap<String, String>,
}

impl LoaderOptions {
    /// Options rooted at the current directory with nothing enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            config_files: Vec::new(),
            project_name: None,
            discover_default_files: false,
            use_config_file_env: false,
            environment: HashMap::new(),
        }
    }

    /// Sets the directory files are discovered from.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Loads these files, in order, instead of discovering them.
    #[must_use]
    pub fn config_files(mut self, files: Vec<PathBuf>) -> Self {
        self.config_files = files;
        self
    }

    /// Overrides the project name.
    #[must_use]
    pub fn project_name(mut self, name: Option<String>) -> Self {
        self.project_name = name;
        self
    }

    /// Searches the working directory and its parents for a default
    /// compose file name.
    #[must_use]
    pub const fn default_config_path(mut self) -> Self {
        self.discover_default_files = true;
        self
    }

    /// Adds the process environment to the interpolation variables.
    #[must_use]
    pub fn os_env(mut self) -> Self {
        self.environment.extend(std::env::vars());
        self
    }

    /// Adds explicit variables, overriding earlier ones.
    #[must_use]
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Honours `COMPOSE_FILE` when no files are given explicitly.
    #[must_use]
    pub const fn config_file_env(mut self) -> Self {
        self.use_config_file_env = true;
        self
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads compose YAML files from disk.
#[derive(Debug, Clone)]
pub struct ComposeLoader {
    options: LoaderOptions,
}

impl ComposeLoader {
    /// Creates a loader with the given options.
    #[must_use]
    pub const fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Returns the compose files this loader would read, in order.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Loader`] if no file can be located.
    pub fn config_paths(&self) -> Result<Vec<PathBuf>> {
        let opts = &self.options;
        if !opts.config_files.is_empty() {
            return Ok(opts
                .config_files
                .iter()
                .map(|f| opts.working_dir.join(f))
                .collect());
        }

        if opts.use_config_file_env {
            if let Some(list) = opts.environment.get(COMPOSE_FILE_ENV).filter(|l| !l.is_empty()) {
                let separator = opts
                    .environment
                    .get(COMPOSE_PATH_SEPARATOR_ENV)
                    .map_or(DEFAULT_PATH_SEPARATOR, String::as_str);
                return Ok(list
                    .split(separator)
                    .filter(|p| !p.is_empty())
                    .map(|p| opts.working_dir.join(p))
                    .collect());
            }
        }

        if opts.discover_default_files {
            if let Some(found) = find_default_file(&opts.working_dir) {
                return Ok(vec![found]);
            }
        }

        Err(StevedoreError::Loader {
            path: opts.working_dir.clone(),
            message: format!(
                "no configuration file provided: none of {} found",
                DEFAULT_COMPOSE_FILES.join(", ")
            ),
        })
    }
}

impl ProjectLoader for ComposeLoader {
    fn load(&self) -> Result<Project> {
        let paths = self.config_paths()?;
        let first = paths.first().cloned().unwrap_or_default();
        let project_dir = first
            .parent()
            .map_or_else(|| self.options.working_dir.clone(), Path::to_path_buf);
        let project_dir = project_dir.canonicalize().unwrap_or(project_dir);

        let mut environment = read_dotenv(&project_dir.join(DOTENV_FILE))?;
        environment.extend(self.options.environment.clone());

        let mut documents = Vec::with_capacity(paths.len());
        for path in &paths {
            tracing::info!(path = %path.display(), "loading compose file");
            let content = std::fs::read_to_string(path).map_err(|e| StevedoreError::Io {
                path: path.clone(),
                source: e,
            })?;
            documents.push((path.clone(), content));
        }

        load_documents(
            &documents,
            &project_dir,
            &environment,
            self.options.project_name.as_deref(),
        )
    }
}

/// Builds a project from already-read compose documents.
///
/// `documents` pairs each file's path (used in error messages) with its
/// contents; later documents override earlier ones.
///
/// # Errors
///
/// Returns [`StevedoreError::Loader`] if a document is not valid YAML,
/// interpolation fails, or a value cannot be normalised.
pub fn load_documents(
    documents: &[(PathBuf, String)],
    project_dir: &Path,
    environment: &HashMap<String, String>,
    project_name: Option<&str>,
) -> Result<Project> {
    let lookup = |name: &str| environment.get(name).cloned();
    let mut merged = Value::Null;

    for (path, content) in documents {
        let loader_err = |message: String| StevedoreError::Loader {
            path: path.clone(),
            message,
        };
        let mut doc: Value = serde_yaml::from_str(content).map_err(|e| loader_err(e.to_string()))?;
        interpolate_value(&mut doc, &lookup).map_err(loader_err)?;
        merge_values(&mut merged, doc);
    }

    let origin = documents
        .first()
        .map_or_else(|| project_dir.to_path_buf(), |(p, _)| p.clone());
    let loader_err = |message: String| StevedoreError::Loader {
        path: origin.clone(),
        message,
    };

    let file: RawComposeFile = if merged.is_null() {
        RawComposeFile::default()
    } else {
        serde_yaml::from_value(merged).map_err(|e| loader_err(e.to_string()))?
    };

    let name = project_name
        .map(ToString::to_string)
        .or_else(|| environment.get(COMPOSE_PROJECT_NAME_ENV).cloned())
        .filter(|n| !n.is_empty())
        .or(file.name)
        .or_else(|| {
            project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    let name = normalize_project_name(&name);
    if name.is_empty() {
        return Err(loader_err("project name must not be empty".into()));
    }

    let normalizer = Normalizer {
        project_dir,
        environment,
    };
    let mut project = Project::new(name, project_dir);
    for (service_name, raw) in file.services {
        let service = normalizer
            .service(&service_name, raw)
            .map_err(|e| loader_err(format!("service \"{service_name}\": {e}")))?;
        project = project.with_service(service);
    }

    tracing::debug!(
        project = %project.name,
        services = project.services.len(),
        "project loaded"
    );
    Ok(project)
}

fn find_default_file(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Reads `KEY=VALUE` lines; a missing file yields no variables.
fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(StevedoreError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    Ok(parse_dotenv(&content))
}

fn parse_dotenv(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = ['"', '\'']
                .iter()
                .find_map(|&q| value.strip_prefix(q).and_then(|v| v.strip_suffix(q)))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn interpolate_value<F>(value: &mut Value, lookup: &F) -> std::result::Result<(), String>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            *s = interpolate::interpolate(s, lookup)?;
        }
        Value::Sequence(items) => {
            for item in items {
                interpolate_value(item, lookup)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, lookup)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, lookup)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Mappings merge recursively, sequences append, anything else is replaced.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        let _ = base.insert(key, value);
                    }
                }
            }
        }
        (Value::Sequence(base), Value::Sequence(overlay)) => base.extend(overlay),
        (base, overlay) => *base = overlay,
    }
}

/// Lowercases and keeps only `[a-z0-9_-]`, trimming leading separators.
fn normalize_project_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect::<String>()
        .trim_start_matches(['_', '-'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumeType;

    fn load(yaml: &str) -> Result<Project> {
        let env = HashMap::from([
            ("TAG".to_string(), "15".to_string()),
            ("WEB_PORT".to_string(), "8080".to_string()),
            ("API_KEY".to_string(), "secret".to_string()),
        ]);
        load_documents(
            &[(PathBuf::from("/srv/shop/compose.yaml"), yaml.to_string())],
            Path::new("/srv/shop"),
            &env,
            None,
        )
    }

    #[test]
    fn loads_two_service_project() {
        let project = load(
            r#"
services:
  db:
    image: "postgres:${TAG}"
  web:
    image: app
    ports:
      - "${WEB_PORT}:80"
    depends_on:
      - db
"#,
        )
        .expect("project");

        assert_eq!(project.name, "shop");
        let db = project.service("db").expect("db");
        assert_eq!(db.image.as_deref(), Some("postgres:15"));
        let web = project.service("web").expect("web");
        assert_eq!(web.ports.len(), 1);
        assert_eq!(web.ports[0].published, "8080");
        assert_eq!(web.ports[0].target, 80);
        assert_eq!(web.ports[0].mode, "ingress");
        assert!(web.depends_on.contains("db"));
    }

    #[test]
    fn environment_list_and_map_forms() {
        let project = load(
            r"
services:
  a:
    image: x
    environment:
      - PLAIN=1
      - API_KEY
      - UNSET_ONE
  b:
    image: x
    environment:
      DEBUG: true
      RETRIES: 3
      EMPTY:
",
        )
        .expect("project");

        let a = &project.services["a"].environment;
        assert_eq!(a.get("PLAIN"), Some(&Some("1".to_string())));
        assert_eq!(a.get("API_KEY"), Some(&Some("secret".to_string())));
        assert_eq!(a.get("UNSET_ONE"), Some(&None));

        let b = &project.services["b"].environment;
        assert_eq!(b.get("DEBUG"), Some(&Some("true".to_string())));
        assert_eq!(b.get("RETRIES"), Some(&Some("3".to_string())));
        assert_eq!(b.get("EMPTY"), Some(&None));
    }

    #[test]
    fn build_command_and_long_syntax() {
        let project = load(
            r#"
services:
  api:
    build:
      context: ./api
      dockerfile: Dockerfile.dev
      target: runtime
      args:
        VERSION: "1.2"
        UNSET:
    command: ./server --port "80 80"
    privileged: true
    ports:
      - target: 53
        published: 5353
        protocol: udp
        mode: host
    expose:
      - 9000
      - "9001/udp"
    volumes:
      - type: tmpfs
        target: /run
    depends_on:
      cache:
        condition: service_healthy
  cache:
    image: redis
"#,
        )
        .expect("project");

        let api = project.service("api").expect("api");
        let build = api.build.as_ref().expect("build");
        assert_eq!(build.context, PathBuf::from("/srv/shop/api"));
        assert_eq!(build.dockerfile.as_deref(), Some("Dockerfile.dev"));
        assert_eq!(build.target.as_deref(), Some("runtime"));
        assert_eq!(build.args.get("VERSION"), Some(&Some("1.2".to_string())));
        assert_eq!(build.args.get("UNSET"), Some(&None));
        assert_eq!(api.command, vec!["./server", "--port", "80 80"]);
        assert!(api.privileged);
        assert_eq!(api.ports[0].published, "5353");
        assert_eq!(api.ports[0].protocol, "udp");
        assert_eq!(api.ports[0].mode, "host");
        assert_eq!(api.expose, vec!["9000", "9001/udp"]);
        assert_eq!(api.volumes[0].kind, VolumeType::Other("tmpfs".into()));
        assert!(api.depends_on.contains("cache"));
    }

    #[test]
    fn later_documents_override_earlier_ones() {
        let env = HashMap::new();
        let project = load_documents(
            &[
                (
                    PathBuf::from("compose.yaml"),
                    "services:\n  web:\n    image: app:1\n    ports: [\"8080:80\"]\n".into(),
                ),
                (
                    PathBuf::from("compose.override.yaml"),
                    "services:\n  web:\n    image: app:2\n    ports: [\"8443:443\"]\n".into(),
                ),
            ],
            Path::new("/work/My Project"),
            &env,
            None,
        )
        .expect("project");

        assert_eq!(project.name, "myproject");
        let web = project.service("web").expect("web");
        assert_eq!(web.image.as_deref(), Some("app:2"));
        assert_eq!(web.ports.len(), 2);
    }

    #[test]
    fn project_name_precedence() {
        let env = HashMap::from([(COMPOSE_PROJECT_NAME_ENV.to_string(), "FromEnv".to_string())]);
        let docs = [(PathBuf::from("c.yaml"), "name: fromfile\nservices: {}\n".to_string())];
        let project = load_documents(&docs, Path::new("/x/dir"), &env, None).expect("project");
        assert_eq!(project.name, "fromenv");
        let project =
            load_documents(&docs, Path::new("/x/dir"), &env, Some("Explicit")).expect("project");
        assert_eq!(project.name, "explicit");
        let project =
            load_documents(&docs, Path::new("/x/dir"), &HashMap::new(), None).expect("project");
        assert_eq!(project.name, "fromfile");
    }

    #[test]
    fn missing_required_variable_is_a_loader_error() {
        let err = load("services:\n  web:\n    image: \"app:${MISSING:?tag required}\"\n")
            .unwrap_err();
        assert!(matches!(err, StevedoreError::Loader { .. }), "got: {err}");
        assert!(err.to_string().contains("tag required"), "got: {err}");
    }

    #[test]
    fn invalid_yaml_is_a_loader_error() {
        let err = load("services: [unclosed").unwrap_err();
        assert!(matches!(err, StevedoreError::Loader { .. }), "got: {err}");
    }

    #[test]
    fn invalid_port_names_field() {
        let err =
            load("services:\n  web:\n    image: x\n    ports: [\"80-81:80-81\"]\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("web"), "got: {msg}");
        assert!(msg.contains("ports[0]"), "got: {msg}");
    }

    #[test]
    fn dotenv_parsing() {
        let vars = parse_dotenv("# comment\nexport A=1\nB = \"two\"\nC='three'\n\nbroken\n");
        assert_eq!(vars.get("A").map(String::as_str), Some("1"));
        assert_eq!(vars.get("B").map(String::as_str), Some("two"));
        assert_eq!(vars.get("C").map(String::as_str), Some("three"));
        assert!(!vars.contains_key("broken"));
    }

    #[test]
    fn project_names_are_normalized() {
        assert_eq!(normalize_project_name("My App.v2"), "myappv2");
        assert_eq!(normalize_project_name("-_demo"), "demo");
    }
}
