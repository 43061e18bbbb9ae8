//! Translates one service descriptor into an inert execution unit.
//!
//! Every structurally unordered input (environment, build args) is sorted
//! by name before it reaches the unit, so two builds of the same
//! descriptor produce identical construction sequences.

use std::path::Path;

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::TransportProtocol;
use stevedore_compose::model::{BuildSpec, ServiceDescriptor, VolumeMount, VolumeType};

use crate::backend::ExecutionBackend;
use crate::publish;
use crate::unit::ExecutionUnit;

/// Builds the execution unit for `service` without its dependency
/// bindings or command.
///
/// The result is inert; nothing is started.
///
/// # Errors
///
/// Returns [`StevedoreError::Config`] for an unsupported port mode,
/// protocol, volume type, or a non-integer published port, and propagates
/// backend errors from directory and volume resolution.
pub fn build_unit(
    backend: &dyn ExecutionBackend,
    service: &ServiceDescriptor,
) -> Result<ExecutionUnit> {
    let mut unit = backend.container(&service.name);

    if let Some(image) = &service.image {
        unit = unit.with_image(image);
    } else if let Some(build) = &service.build {
        unit = apply_build(backend, unit, build)?;
    } else {
        tracing::debug!(service = %service.name, "service has neither image nor build");
    }

    let mut env: Vec<(&String, &String)> = service
        .environment
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| (name, v)))
        .collect();
    env.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (name, value) in env {
        unit = unit.with_env_variable(name, value);
    }

    for (idx, port) in service.ports.iter().enumerate() {
        let endpoint = publish::endpoint_for(&service.name, idx, port)?;
        unit = unit.with_exposed_port(endpoint.target, endpoint.protocol);
    }

    for (idx, expose) in service.expose.iter().enumerate() {
        let (port, protocol) = parse_expose(&service.name, idx, expose)?;
        unit = unit.with_exposed_port(port, protocol);
    }

    for (idx, volume) in service.volumes.iter().enumerate() {
        unit = apply_volume(backend, unit, &service.name, idx, volume)?;
    }

    Ok(unit)
}

/// Appends the service's command as the unit's final step.
///
/// `privileged` services run that step with insecure root capabilities.
#[must_use]
pub fn finalize_unit(unit: ExecutionUnit, service: &ServiceDescriptor) -> ExecutionUnit {
    unit.with_exec(service.command.clone(), service.privileged)
}

fn apply_build(
    backend: &dyn ExecutionBackend,
    unit: ExecutionUnit,
    build: &BuildSpec,
) -> Result<ExecutionUnit> {
    let context = backend.host_directory(&build.context)?;
    let mut args: Vec<(String, String)> = build
        .args
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| (name.clone(), v.clone())))
        .collect();
    args.sort_unstable();
    Ok(unit.with_build(context, build.dockerfile.clone(), build.target.clone(), args))
}

fn parse_expose(service: &str, index: usize, expose: &str) -> Result<(u16, TransportProtocol)> {
    let field = format!("expose[{index}]");
    let (port, protocol) = expose.split_once('/').unwrap_or((expose, ""));
    let protocol = publish::parse_protocol(service, &field, protocol)?;
    let port = port.trim().parse().map_err(|_| {
        StevedoreError::config(
            service,
            &field,
            format!("exposed port \"{expose}\" is not a valid port number"),
        )
    })?;
    Ok((port, protocol))
}

fn apply_volume(
    backend: &dyn ExecutionBackend,
    unit: ExecutionUnit,
    service: &str,
    index: usize,
    volume: &VolumeMount,
) -> Result<ExecutionUnit> {
    let source = || {
        volume.source.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| {
            StevedoreError::config(
                service,
                format!("volumes[{index}].source"),
                format!("{} volume at {} has no source", volume.kind, volume.target),
            )
        })
    };
    match &volume.kind {
        VolumeType::Bind => {
            let dir = backend.host_directory(Path::new(source()?))?;
            Ok(unit.with_mounted_directory(&volume.target, dir, volume.read_only))
        }
        VolumeType::Volume => {
            let cache = backend.cache_volume(source()?)?;
            Ok(unit.with_mounted_cache(&volume.target, cache))
        }
        VolumeType::Other(kind) => Err(StevedoreError::config(
            service,
            format!("volumes[{index}].type"),
            format!("volume type {kind} not supported"),
        )),
    }
}
