//! Serde mirror of the compose file format.
//!
//! Accepts both the short and long syntax for every field and normalises
//! them into the descriptor model.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::model::{BuildSpec, PortConfig, ServiceDescriptor, VolumeMount, VolumeType};

/// Root of a compose document after interpolation.
#[derive(Debug, Default, Deserialize)]
pub struct RawComposeFile {
    /// Top-level `name:`.
    pub name: Option<String>,
    /// Service definitions.
    #[serde(default)]
    pub services: BTreeMap<String, RawService>,
}

/// One service as written in the file.
#[derive(Debug, Default, Deserialize)]
pub struct RawService {
    image: Option<String>,
    build: Option<RawBuild>,
    command: Option<RawCommand>,
    environment: Option<RawMapOrList>,
    #[serde(default)]
    ports: Vec<RawPort>,
    #[serde(default)]
    expose: Vec<RawScalar>,
    #[serde(default)]
    volumes: Vec<RawVolume>,
    depends_on: Option<RawDependsOn>,
    #[serde(default)]
    privileged: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBuild {
    Context(String),
    Full {
        context: Option<String>,
        dockerfile: Option<String>,
        target: Option<String>,
        args: Option<RawMapOrList>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl RawScalar {
    fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Int(n) => n.to_string(),
            Self::Float(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMapOrList {
    Map(BTreeMap<String, Option<RawScalar>>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u32),
    Short(String),
    Long {
        target: u32,
        published: Option<RawScalar>,
        host_ip: Option<String>,
        protocol: Option<String>,
        mode: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVolume {
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: String,
        source: Option<String>,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

/// Context needed to normalise a raw service.
pub struct Normalizer<'a> {
    /// Directory relative paths are resolved against.
    pub project_dir: &'a Path,
    /// Variables used for bare `KEY` environment entries.
    pub environment: &'a HashMap<String, String>,
}

impl Normalizer<'_> {
    /// Converts a raw service into a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field when a value cannot be
    /// normalised.
    pub fn service(&self, name: &str, raw: RawService) -> Result<ServiceDescriptor, String> {
        let command = match raw.command {
            Some(RawCommand::Shell(line)) => super::words::split(&line)?,
            Some(RawCommand::Exec(args)) => args,
            None => Vec::new(),
        };

        let ports = raw
            .ports
            .into_iter()
            .enumerate()
            .map(|(idx, port)| parse_port(port).map_err(|e| format!("ports[{idx}]: {e}")))
            .collect::<Result<Vec<_>, _>>()?;

        let volumes = raw
            .volumes
            .into_iter()
            .enumerate()
            .map(|(idx, vol)| self.volume(vol).map_err(|e| format!("volumes[{idx}]: {e}")))
            .collect::<Result<Vec<_>, _>>()?;

        let depends_on: BTreeSet<String> = match raw.depends_on {
            Some(RawDependsOn::List(names)) => names.into_iter().collect(),
            Some(RawDependsOn::Map(entries)) => entries.into_keys().collect(),
            None => BTreeSet::new(),
        };

        Ok(ServiceDescriptor {
            name: name.to_string(),
            image: raw.image,
            build: raw.build.map(|b| self.build(b)),
            command,
            environment: raw
                .environment
                .map_or_else(HashMap::new, |env| self.mapping(env)),
            ports,
            expose: raw.expose.into_iter().map(RawScalar::into_string).collect(),
            volumes,
            depends_on,
            privileged: raw.privileged,
        })
    }

    fn build(&self, raw: RawBuild) -> BuildSpec {
        match raw {
            RawBuild::Context(context) => BuildSpec {
                context: self.resolve(&context),
                ..BuildSpec::default()
            },
            RawBuild::Full {
                context,
                dockerfile,
                target,
                args,
            } => BuildSpec {
                context: self.resolve(context.as_deref().unwrap_or(".")),
                dockerfile,
                target,
                args: args.map_or_else(HashMap::new, |a| self.mapping(a)),
            },
        }
    }

    /// `KEY=VALUE` list entries become values; a bare `KEY` takes its
    /// value from the loader environment, or stays unset.
    fn mapping(&self, raw: RawMapOrList) -> HashMap<String, Option<String>> {
        match raw {
            RawMapOrList::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| (k, v.map(RawScalar::into_string)))
                .collect(),
            RawMapOrList::List(items) => items
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => {
                        let value = self.environment.get(&item).cloned();
                        (item, value)
                    }
                })
                .collect(),
        }
    }

    fn volume(&self, raw: RawVolume) -> Result<VolumeMount, String> {
        match raw {
            RawVolume::Long {
                kind,
                source,
                target,
                read_only,
            } => {
                let kind = VolumeType::from(kind);
                let source = match (&kind, source) {
                    (VolumeType::Bind, Some(src)) => Some(self.resolve_host(&src)),
                    (_, source) => source,
                };
                Ok(VolumeMount {
                    kind,
                    source,
                    target,
                    read_only,
                })
            }
            RawVolume::Short(spec) => self.short_volume(&spec),
        }
    }

    fn short_volume(&self, spec: &str) -> Result<VolumeMount, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, options) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, options] => (Some(*source), *target, Some(*options)),
            _ => return Err(format!("invalid volume specification \"{spec}\"")),
        };
        if target.is_empty() {
            return Err(format!("invalid volume specification \"{spec}\": empty target"));
        }
        let read_only = options.is_some_and(|o| o.split(',').any(|opt| opt == "ro"));
        let (kind, source) = match source {
            Some(src) if is_host_path(src) => (VolumeType::Bind, Some(self.resolve_host(src))),
            Some(src) => (VolumeType::Volume, Some(src.to_string())),
            None => (VolumeType::Volume, None),
        };
        Ok(VolumeMount {
            kind,
            source,
            target: target.to_string(),
            read_only,
        })
    }

    fn resolve_host(&self, source: &str) -> String {
        self.resolve(source).to_string_lossy().into_owned()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = match path.strip_prefix('~') {
            Some(rest) => self
                .environment
                .get("HOME")
                .map_or_else(|| PathBuf::from(path), |home| {
                    PathBuf::from(home).join(rest.trim_start_matches('/'))
                }),
            None => PathBuf::from(path),
        };
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.project_dir.join(expanded)
        };
        joined
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

fn parse_port(raw: RawPort) -> Result<PortConfig, String> {
    match raw {
        RawPort::Number(target) => Ok(PortConfig::ingress(String::new(), port_number(target)?)),
        RawPort::Short(spec) => parse_short_port(&spec),
        RawPort::Long {
            target,
            published,
            host_ip,
            protocol,
            mode,
        } => Ok(PortConfig {
            target: port_number(target)?,
            published: published.map(RawScalar::into_string).unwrap_or_default(),
            host_ip,
            mode: mode.unwrap_or_else(|| stevedore_common::constants::INGRESS_MODE.to_string()),
            protocol: protocol.unwrap_or_default(),
        }),
    }
}

fn port_number(value: u32) -> Result<u16, String> {
    u16::try_from(value).map_err(|_| format!("port {value} is out of range"))
}

/// Parses `[[host_ip:]published:]target[/protocol]`; IPv6 host addresses
/// are written in brackets.
fn parse_short_port(spec: &str) -> Result<PortConfig, String> {
    let (body, protocol) = spec.split_once('/').unwrap_or((spec, ""));

    let (host_ip, rest) = match body.strip_prefix('[') {
        Some(bracketed) => {
            let (ip, rest) = bracketed
                .split_once("]:")
                .ok_or_else(|| format!("invalid port specification \"{spec}\""))?;
            (Some(ip.to_string()), rest)
        }
        None => (None, body),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    let (host_ip, published, target) = match (host_ip, parts.as_slice()) {
        (None, [target]) => (None, "", *target),
        (host_ip, [published, target]) => (host_ip, *published, *target),
        (None, [ip, published, target]) => (Some((*ip).to_string()), *published, *target),
        _ => return Err(format!("invalid port specification \"{spec}\"")),
    };

    let target = target.parse::<u16>().map_err(|_| {
        format!("invalid target port \"{target}\" in \"{spec}\"; port ranges are not supported")
    })?;

    Ok(PortConfig {
        target,
        published: published.to_string(),
        host_ip: host_ip.filter(|ip| !ip.is_empty()),
        mode: stevedore_common::constants::INGRESS_MODE.to_string(),
        protocol: protocol.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_port_forms() {
        let port = parse_short_port("8080:80").expect("port");
        assert_eq!((port.published.as_str(), port.target), ("8080", 80));
        assert!(port.protocol.is_empty());

        let port = parse_short_port("127.0.0.1:5353:53/udp").expect("port");
        assert_eq!(port.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(port.protocol, "udp");

        let port = parse_short_port("[::1]:8443:443").expect("port");
        assert_eq!(port.host_ip.as_deref(), Some("::1"));
        assert_eq!(port.published, "8443");

        let port = parse_short_port("80").expect("port");
        assert!(port.published.is_empty());
    }

    #[test]
    fn short_port_rejects_ranges() {
        assert!(parse_short_port("8000-8001:80-81").is_err());
        assert!(parse_short_port("a:b:c:d").is_err());
    }

    #[test]
    fn short_volume_classification() {
        let env = HashMap::from([("HOME".to_string(), "/home/dev".to_string())]);
        let normalizer = Normalizer {
            project_dir: Path::new("/srv/app"),
            environment: &env,
        };

        let bind = normalizer.short_volume("./src:/app:ro").expect("bind");
        assert_eq!(bind.kind, VolumeType::Bind);
        assert_eq!(bind.source.as_deref(), Some("/srv/app/src"));
        assert!(bind.read_only);

        let home = normalizer.short_volume("~/cache:/cache").expect("home");
        assert_eq!(home.source.as_deref(), Some("/home/dev/cache"));

        let named = normalizer.short_volume("pgdata:/var/lib/postgresql").expect("named");
        assert_eq!(named.kind, VolumeType::Volume);
        assert_eq!(named.source.as_deref(), Some("pgdata"));

        let anonymous = normalizer.short_volume("/scratch").expect("anonymous");
        assert_eq!(anonymous.kind, VolumeType::Volume);
        assert!(anonymous.source.is_none());
    }
}
