use std::collections::HashMap;

use regex::Regex;

use crate::errors::{AgentError, AgentResult};

/// Internal actions handled by the agent itself rather than an external
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    UpdateAgent,
    SystemUpdate,
    ContainerAction,
    StressCpu,
    StressRam,
    ListPackages,
    KillProcess,
}

/// A whitelist entry. The variable argument, once validated, is appended as a
/// single argv element; it never passes through a shell.
#[derive(Debug)]
pub enum CommandKind {
    External {
        bin: &'static str,
        fixed_args: &'static [&'static str],
        validate: Option<Regex>,
    },
    Internal(Handler),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(windows) {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }
}

/// Immutable command whitelist, built once at startup for the host's OS
/// family. There is no way to run anything that is not listed here.
pub struct CommandRegistry {
    entries: HashMap<&'static str, CommandKind>,
}

// key, bin, fixed args, validation pattern for the variable argument
type ExternalRow = (
    &'static str,
    &'static str,
    &'static [&'static str],
    Option<&'static str>,
);

const HOSTNAME_PATTERN: &str = r"[a-zA-Z0-9.-]+";
const SERVICE_PATTERN: &str = r"[a-zA-Z0-9._-]+";

const LINUX_COMMANDS: &[ExternalRow] = &[
    ("ping", "ping", &["-c", "4"], Some(HOSTNAME_PATTERN)),
    ("uptime", "uptime", &[], None),
    ("disk_space", "df", &["-h"], None),
    (
        "services",
        "systemctl",
        &["list-units", "--type=service", "--state=running"],
        None,
    ),
    (
        "check_service",
        "systemctl",
        &["is-active"],
        Some(SERVICE_PATTERN),
    ),
    ("restart_vm", "reboot", &[], None),
];

const WINDOWS_COMMANDS: &[ExternalRow] = &[
    ("ping", "ping", &["-n", "4"], Some(HOSTNAME_PATTERN)),
    (
        "uptime",
        "powershell",
        &[
            "-Command",
            "(Get-Date) - (Get-CimInstance Win32_OperatingSystem).LastBootUpTime",
        ],
        None,
    ),
    (
        "disk_space",
        "powershell",
        &[
            "-Command",
            "Get-PSDrive -PSProvider FileSystem | Format-Table Name,Used,Free,@{N='Size';E={$_.Used+$_.Free}}",
        ],
        None,
    ),
    (
        "services",
        "powershell",
        &[
            "-Command",
            "Get-Service | Where-Object Status -eq Running | Format-Table Name,DisplayName,Status",
        ],
        None,
    ),
    (
        "check_service",
        "powershell",
        &["-Command", "Get-Service"],
        Some(SERVICE_PATTERN),
    ),
    ("restart_vm", "shutdown", &["/r", "/t", "5"], None),
];

const INTERNAL_COMMANDS: &[(&str, Handler)] = &[
    ("update_agent", Handler::UpdateAgent),
    ("system_update", Handler::SystemUpdate),
    ("container_action", Handler::ContainerAction),
    ("stress_cpu", Handler::StressCpu),
    ("stress_ram", Handler::StressRam),
    ("list_packages", Handler::ListPackages),
    ("kill_process", Handler::KillProcess),
];

impl CommandRegistry {
    pub fn for_platform(family: OsFamily) -> AgentResult<Self> {
        let rows = match family {
            OsFamily::Linux => LINUX_COMMANDS,
            OsFamily::Windows => WINDOWS_COMMANDS,
        };

        let mut entries = HashMap::new();
        for &(key, bin, fixed_args, pattern) in rows {
            let validate = match pattern {
                Some(p) => Some(anchored(p)?),
                None => None,
            };
            entries.insert(
                key,
                CommandKind::External {
                    bin,
                    fixed_args,
                    validate,
                },
            );
        }
        for (key, handler) in INTERNAL_COMMANDS {
            entries.insert(*key, CommandKind::Internal(*handler));
        }

        Ok(Self { entries })
    }

    pub fn current() -> AgentResult<Self> {
        Self::for_platform(OsFamily::current())
    }

    pub fn get(&self, key: &str) -> Option<&CommandKind> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Compile a validation pattern so it must match the entire argument string.
fn anchored(pattern: &str) -> AgentResult<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| AgentError::ConfigError(format!("bad whitelist pattern '{}': {}", pattern, e)))
}

/// Validation policy, evaluated before any process is constructed: a defined
/// pattern must fully match the variable argument; with no pattern, any
/// non-empty argument is itself a failure. No pass-through path exists.
pub fn validate_args(kind: &CommandKind, args: &str) -> AgentResult<()> {
    let validate = match kind {
        CommandKind::External { validate, .. } => validate,
        // Internal handlers re-validate their own argument grammar.
        CommandKind::Internal(_) => return Ok(()),
    };

    match validate {
        Some(re) => {
            if args.is_empty() || !re.is_match(args) {
                Err(AgentError::ValidationError(
                    "invalid_arguments: argument does not match whitelist pattern".to_string(),
                ))
            } else {
                Ok(())
            }
        }
        None => {
            if args.is_empty() {
                Ok(())
            } else {
                Err(AgentError::ValidationError(
                    "invalid_arguments: command takes no arguments".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux() -> CommandRegistry {
        CommandRegistry::for_platform(OsFamily::Linux).unwrap()
    }

    #[test]
    fn test_both_platforms_expose_the_same_keys() {
        let linux = linux();
        let windows = CommandRegistry::for_platform(OsFamily::Windows).unwrap();
        let mut a: Vec<_> = linux.entries.keys().collect();
        let mut b: Vec<_> = windows.entries.keys().collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_key_is_absent() {
        assert!(!linux().contains("rm"));
        assert!(!linux().contains("bash"));
    }

    #[test]
    fn test_pattern_accepts_full_match_only() {
        let registry = linux();
        let ping = registry.get("ping").unwrap();
        assert!(validate_args(ping, "10.0.0.5").is_ok());
        assert!(validate_args(ping, "host-1.example.com").is_ok());
        // Shell metacharacters and embedded whitespace must never get through.
        assert!(validate_args(ping, "10.0.0.5; rm -rf /").is_err());
        assert!(validate_args(ping, "10.0.0.5 extra").is_err());
        assert!(validate_args(ping, "$(whoami)").is_err());
        assert!(validate_args(ping, "").is_err());
    }

    #[test]
    fn test_no_pattern_rejects_any_argument() {
        let registry = linux();
        let uptime = registry.get("uptime").unwrap();
        assert!(validate_args(uptime, "").is_ok());
        assert!(validate_args(uptime, "-p").is_err());
        assert!(validate_args(uptime, "; reboot").is_err());
    }

    #[test]
    fn test_check_service_pattern() {
        let registry = linux();
        let entry = registry.get("check_service").unwrap();
        assert!(validate_args(entry, "nginx.service").is_ok());
        assert!(validate_args(entry, "sshd").is_ok());
        assert!(validate_args(entry, "sshd nginx").is_err());
    }

    #[test]
    fn test_internal_handlers_registered() {
        let registry = linux();
        assert!(matches!(
            registry.get("kill_process"),
            Some(CommandKind::Internal(Handler::KillProcess))
        ));
        assert!(matches!(
            registry.get("update_agent"),
            Some(CommandKind::Internal(Handler::UpdateAgent))
        ));
    }
}
