//! Hostname resolution strategies attached to every emitted event

use std::{env, fmt, io, str::FromStr, time::Duration};

use async_trait::async_trait;
use dns_lookup::{getaddrinfo, lookup_addr, lookup_host, AddrInfoHints};
use serde::Serialize;
use thiserror::Error;

use crate::shell::{self, CommandStatus, ShellError};

/// Used in place of the real hostname whenever resolution fails.
pub const FALLBACK_HOSTNAME: &str = "localhost";
pub const HOSTNAME_ENV_VAR: &str = "SYSD_WATCH_HOSTNAME";
pub const DEFAULT_HOSTNAME_TIMEOUT: Duration = Duration::from_secs(20);

const HOSTNAME_SHELL: &str = "bash";
const HOSTNAME_EXPRESSION: &str = "/bin/hostname -f";
const HOSTS_FILE: &str = "/etc/hosts";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostnameMethod {
    /// Hostname as reported by the kernel.
    #[default]
    Os,
    /// Canonical name from the hosts file or the resolver.
    Fqdn,
    /// Reverse lookup of the first IPv4 address of the OS hostname.
    Rfqdn,
    /// Trimmed output of `hostname -f`.
    Cmd,
    /// Value of `SYSD_WATCH_HOSTNAME`.
    Env,
}

impl FromStr for HostnameMethod {
    type Err = HostnameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OS" => Ok(Self::Os),
            "FQDN" => Ok(Self::Fqdn),
            "RFQDN" => Ok(Self::Rfqdn),
            "CMD" => Ok(Self::Cmd),
            "ENV" => Ok(Self::Env),
            _ => Err(HostnameError::Unsupported(value.to_string())),
        }
    }
}

impl fmt::Display for HostnameMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Os => "OS",
            Self::Fqdn => "FQDN",
            Self::Rfqdn => "RFQDN",
            Self::Cmd => "CMD",
            Self::Env => "ENV",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HostnameError {
    #[error("unsupported method {0:?} specified")]
    Unsupported(String),
    #[error("failed to read hostname: {0}")]
    Io(String),
    #[error("hostname lookup failed: {0}")]
    Lookup(String),
    #[error("hostname command exited with {exit_code:?}: {stderr}")]
    Command {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("getting empty response in CMD hostname method: {stderr}")]
    EmptyOutput { stderr: String },
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("hostname resolution timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Source of the host name stamped on events.
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    async fn resolve(&self) -> Result<String, HostnameError>;
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyResolver {
    pub method: HostnameMethod,
    pub timeout: Duration,
}

impl StrategyResolver {
    pub fn new(method: HostnameMethod, timeout: Duration) -> Self {
        Self { method, timeout }
    }
}

#[async_trait]
impl HostnameResolver for StrategyResolver {
    async fn resolve(&self) -> Result<String, HostnameError> {
        resolve_hostname(self.method, self.timeout).await
    }
}

pub async fn resolve_hostname(
    method: HostnameMethod,
    timeout: Duration,
) -> Result<String, HostnameError> {
    let hostname = match method {
        HostnameMethod::Os => os_hostname()?,
        HostnameMethod::Fqdn => blocking_lookup(timeout, fqdn_hostname).await?,
        HostnameMethod::Rfqdn => blocking_lookup(timeout, reverse_fqdn_hostname).await?,
        HostnameMethod::Cmd => {
            let status = shell::run_expression(HOSTNAME_SHELL, HOSTNAME_EXPRESSION, timeout).await?;
            hostname_from_command(status)?
        }
        HostnameMethod::Env => env::var(HOSTNAME_ENV_VAR)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or(HostnameError::MissingEnv(HOSTNAME_ENV_VAR))?,
    };
    Ok(hostname.trim().to_string())
}

async fn blocking_lookup<F>(timeout: Duration, lookup: F) -> Result<String, HostnameError>
where
    F: FnOnce() -> Result<String, HostnameError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(lookup)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HostnameError::Lookup(join_err.to_string())),
        Err(_) => Err(HostnameError::Timeout(timeout)),
    }
}

fn os_hostname() -> Result<String, HostnameError> {
    hostname::get()
        .map_err(|err| HostnameError::Io(err.to_string()))?
        .into_string()
        .map_err(|_| HostnameError::Io("hostname is not valid UTF-8".to_string()))
}

fn fqdn_hostname() -> Result<String, HostnameError> {
    let host = os_hostname()?;
    if let Ok(hosts) = std::fs::read_to_string(HOSTS_FILE) {
        if let Some(fqdn) = fqdn_from_hosts(&hosts, &host) {
            return Ok(fqdn);
        }
    }
    canonical_name(&host)
}

/// Returns the canonical (first) name of the hosts-file entry listing `host`.
pub fn fqdn_from_hosts(hosts: &str, host: &str) -> Option<String> {
    hosts
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            fields.next()?;
            let names: Vec<&str> = fields.collect();
            names
                .contains(&host)
                .then(|| names[0].trim_end_matches('.').to_string())
        })
}

fn canonical_name(host: &str) -> Result<String, HostnameError> {
    let hints = AddrInfoHints {
        flags: libc::AI_CANONNAME,
        ..AddrInfoHints::default()
    };
    let addresses = getaddrinfo(Some(host), None, Some(hints))
        .map_err(|err| HostnameError::Lookup(io::Error::from(err).to_string()))?;

    for address in addresses {
        let address = address.map_err(|err| HostnameError::Lookup(err.to_string()))?;
        if let Some(name) = address.canonname {
            return Ok(name.trim_end_matches('.').to_string());
        }
    }
    Err(HostnameError::Lookup(format!("no canonical name for {host}")))
}

fn reverse_fqdn_hostname() -> Result<String, HostnameError> {
    let host = os_hostname()?;
    let ipv4 = lookup_host(&host)
        .map_err(|err| HostnameError::Lookup(err.to_string()))?
        .into_iter()
        .find(|address| address.is_ipv4());

    let Some(ipv4) = ipv4 else {
        return Ok(host);
    };
    let name = lookup_addr(&ipv4).map_err(|err| HostnameError::Lookup(err.to_string()))?;
    Ok(name.trim_end_matches('.').to_string())
}

fn hostname_from_command(status: CommandStatus) -> Result<String, HostnameError> {
    if !status.success() {
        return Err(HostnameError::Command {
            exit_code: status.exit_code,
            stderr: status.stderr.trim().to_string(),
        });
    }

    let hostname = status.stdout.trim();
    if hostname.is_empty() {
        return Err(HostnameError::EmptyOutput {
            stderr: status.stderr.trim().to_string(),
        });
    }
    Ok(hostname.to_string())
}
