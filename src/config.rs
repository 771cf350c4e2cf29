use crate::coordinator::CoordinatorOptions;
use crate::omnik::pull_session::Timeouts;
use crate::omnik::WifiSerial;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default = "Config::default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "Vec::new")]
    pub listeners: Vec<Listener>,

    #[serde(default = "Vec::new")]
    pub pull: Vec<PullTarget>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default = "Config::default_report_pull_read_failures")]
    pub report_pull_read_failures: bool,
}

// Listener {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Listener {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub name: String,
    pub port: u32,
}
impl Listener {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u32 {
        self.port
    }
} // }}}

// PullTarget {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct PullTarget {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub address: String,
    #[serde(default = "Config::default_pull_port")]
    pub port: u16,
    #[serde(deserialize_with = "de_serial")]
    pub serial: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_pull_interval")]
    pub interval: Duration,
}
impl PullTarget {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
} // }}}

// TimeoutConfig {{{
/// Zero in any of these means wait forever.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "TimeoutConfig::default_connect")]
    pub connect: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "TimeoutConfig::default_read")]
    pub read: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "TimeoutConfig::default_client_idle")]
    pub client_idle: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Self::default_connect(),
            read: Self::default_read(),
            client_idle: Self::default_client_idle(),
        }
    }
}

impl TimeoutConfig {
    fn default_connect() -> Duration {
        Duration::from_secs(10)
    }

    fn default_read() -> Duration {
        Duration::from_secs(30)
    }

    fn default_client_idle() -> Duration {
        Duration::from_secs(900)
    }

    fn bounded(d: Duration) -> Option<Duration> {
        if d.is_zero() {
            None
        } else {
            Some(d)
        }
    }

    pub fn connect(&self) -> Option<Duration> {
        Self::bounded(self.connect)
    }

    pub fn read(&self) -> Option<Duration> {
        Self::bounded(self.read)
    }

    pub fn client_idle(&self) -> Option<Duration> {
        Self::bounded(self.client_idle)
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content).with_context(|| format!("invalid configuration in {}", file))
    }

    pub fn print_summary(&self) {
        info!("Configuration loaded successfully:");
        info!(
            "  Listeners: {} configured, {} enabled",
            self.listeners.len(),
            self.enabled_listeners().len()
        );
        for (i, listener) in self.listeners.iter().enumerate() {
            info!("    Listener[{}]:", i);
            info!("      Enabled: {}", listener.enabled);
            info!("      Name: {}", listener.name);
            info!("      Port: {}", listener.port);
        }

        info!(
            "  Pull targets: {} configured, {} enabled",
            self.pull.len(),
            self.enabled_pull_targets().len()
        );
        for (i, target) in self.pull.iter().enumerate() {
            info!("    Pull[{}]:", i);
            info!("      Enabled: {}", target.enabled);
            info!("      Address: {}:{}", target.address, target.port);
            info!("      Serial: {}", target.serial);
            info!("      Interval: {}s", target.interval.as_secs());
        }

        info!("  Timeouts:");
        info!("    Connect: {}s", self.timeouts.connect.as_secs());
        info!("    Read: {}s", self.timeouts.read.as_secs());
        info!("    Client Idle: {}s", self.timeouts.client_idle.as_secs());
        info!("  Report Pull Read Failures: {}", self.report_pull_read_failures);
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, listener) in self.listeners.iter().enumerate() {
            if listener.name.is_empty() {
                bail!("listeners[{}].name cannot be empty", i);
            }
            if !names.insert(listener.name.as_str()) {
                bail!("listeners[{}].name {} is used more than once", i, listener.name);
            }
            if !(1..=65535).contains(&listener.port) {
                bail!("listeners[{}].port must be between 1 and 65535", i);
            }
        }

        for (i, target) in self.pull.iter().enumerate() {
            if target.address.is_empty() {
                bail!("pull[{}].address cannot be empty", i);
            }
            if target.port == 0 {
                bail!("pull[{}].port must be between 1 and 65535", i);
            }
            if target.interval.is_zero() {
                bail!("pull[{}].interval must be greater than 0", i);
            }
        }

        Ok(())
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn enabled_listeners(&self) -> Vec<Listener> {
        self.listeners.iter().filter(|l| l.enabled()).cloned().collect()
    }

    pub fn enabled_pull_targets(&self) -> Vec<PullTarget> {
        self.pull.iter().filter(|p| p.enabled()).cloned().collect()
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            bind_address: self.bind_address,
            timeouts: Timeouts {
                connect: self.timeouts.connect(),
                read: self.timeouts.read(),
            },
            client_idle: self.timeouts.client_idle(),
            report_read_failures: self.report_pull_read_failures,
        }
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_bind_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_pull_port() -> u16 {
        8899
    }

    fn default_pull_interval() -> Duration {
        Duration::from_secs(300)
    }

    fn default_report_pull_read_failures() -> bool {
        false
    }
}

// serials may be written bare in YAML, which arrives as a number
fn de_serial<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    let s = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    };

    s.parse::<WifiSerial>()
        .map(|_| s)
        .map_err(serde::de::Error::custom)
}
