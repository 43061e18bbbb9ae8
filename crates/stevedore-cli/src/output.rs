//! Formatted output helpers for CLI commands.

use std::fmt::Write as _;

use stevedore_runtime::orchestrator::TaskOutcome;
use stevedore_runtime::unit::UnitOp;

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const YELLOW: &str = "\x1b[33m";
pub const RESET: &str = "\x1b[0m";

/// A double horizontal rule of `width` characters.
#[must_use]
pub fn rule(width: usize) -> String {
    "\u{2550}".repeat(width)
}

/// Colored status marker for a finished task.
#[must_use]
pub fn outcome_marker(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Completed => format!("{GREEN}\u{25cf}{RESET} {DIM}completed{RESET}"),
        TaskOutcome::Cancelled => format!("{YELLOW}\u{25cb}{RESET} {DIM}cancelled{RESET}"),
        TaskOutcome::Failed(message) => format!("{RED}\u{2717}{RESET} {RED}{message}{RESET}"),
    }
}

/// One-line description of a construction step.
#[must_use]
pub fn describe_op(op: &UnitOp) -> String {
    match op {
        UnitOp::From { image } => format!("from {image}"),
        UnitOp::Build {
            context,
            dockerfile,
            target,
            args,
        } => {
            let mut line = format!("build {}", context.path().display());
            if let Some(dockerfile) = dockerfile {
                let _ = write!(line, " -f {dockerfile}");
            }
            if let Some(target) = target {
                let _ = write!(line, " --target {target}");
            }
            for (name, _) in args {
                let _ = write!(line, " --build-arg {name}");
            }
            line
        }
        UnitOp::Env { name, .. } => format!("env {name}"),
        UnitOp::ExposePort { port, protocol } => format!("expose {port}/{protocol}"),
        UnitOp::MountDirectory {
            target,
            source,
            read_only,
        } => {
            let mode = if *read_only { "ro" } else { "rw" };
            format!("mount {} -> {target} ({mode})", source.path().display())
        }
        UnitOp::MountCache { target, volume } => format!("volume {} -> {target}", volume.name()),
        UnitOp::ServiceBinding { alias, unit } => {
            format!("bind {alias} ({})", &unit.fingerprint()[..12])
        }
        UnitOp::Exec {
            args,
            insecure_root_capabilities,
        } => {
            let command = if args.is_empty() {
                "<image default>".to_string()
            } else {
                args.join(" ")
            };
            if *insecure_root_capabilities {
                format!("exec {command} (privileged)")
            } else {
                format!("exec {command}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stevedore_common::types::TransportProtocol;
    use stevedore_runtime::unit::{CacheVolume, ExecutionUnit, HostDirectory};

    use super::*;

    #[test]
    fn rule_has_requested_width() {
        assert_eq!(rule(3).chars().count(), 3);
    }

    #[test]
    fn env_values_are_not_printed() {
        let op = UnitOp::Env {
            name: "DB_PASSWORD".into(),
            value: "hunter2".into(),
        };
        assert_eq!(describe_op(&op), "env DB_PASSWORD");
    }

    #[test]
    fn describes_mounts_and_ports() {
        let unit = ExecutionUnit::new("web")
            .with_exposed_port(53, TransportProtocol::Udp)
            .with_mounted_directory("/app", HostDirectory::new("/srv/app"), true)
            .with_mounted_cache("/data", CacheVolume::new("shop_data"));
        let lines: Vec<String> = unit.ops().iter().map(describe_op).collect();
        assert_eq!(
            lines,
            vec!["expose 53/udp", "mount /srv/app -> /app (ro)", "volume shop_data -> /data"]
        );
    }

    #[test]
    fn describes_bindings_and_exec() {
        let db = Arc::new(ExecutionUnit::new("db").with_image("postgres"));
        let unit = ExecutionUnit::new("web")
            .with_service_binding("db", db)
            .with_exec(Vec::new(), true);
        let lines: Vec<String> = unit.ops().iter().map(describe_op).collect();
        assert!(lines[0].starts_with("bind db ("), "got: {}", lines[0]);
        assert_eq!(lines[1], "exec <image default> (privileged)");
    }

    #[test]
    fn failed_outcome_carries_message() {
        let marker = outcome_marker(&TaskOutcome::Failed("exit status 1".into()));
        assert!(marker.contains("exit status 1"));
    }
}
