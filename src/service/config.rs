extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Address family used when resolving the listen or dial address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    #[default]
    #[serde(rename = "tcp4")]
    Tcp4,
    #[serde(rename = "tcp6")]
    Tcp6,
}

/// Byte order of the two header fields, shared by both ends of a deployment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub ip_version: IpVersion,
    pub addr: String,
    /// 0 means unbounded
    pub read_deadline_ms: u64,
    /// 0 means unbounded
    pub write_deadline_ms: u64,
    /// 0 disables the pool, every request is handled on its own task
    pub worker_pool_size: usize,
    /// capacity of each worker's queue
    pub max_worker_task_len: usize,
    /// capacity of each connection's outbound queue
    pub max_msg_chan_len: usize,
    /// 0 means no limit, which lets any peer header size the read buffer
    pub max_packet_size: u32,
    pub byte_order: ByteOrder,
    pub send_buff_timeout_ms: u64,
    pub worker_monitor_interval_ms: u64,
}

const DEFAULT_MAX_PACKET_SIZE: u32 = 4096;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::Tcp4,
            addr: "0.0.0.0:3000".to_string(),
            read_deadline_ms: 0,
            write_deadline_ms: 0,
            worker_pool_size: 10,
            max_worker_task_len: 1024,
            max_msg_chan_len: 1024,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            byte_order: ByteOrder::Little,
            send_buff_timeout_ms: 5,
            worker_monitor_interval_ms: 5000,
        }
    }
}

impl ServiceConfig {
    pub fn read_deadline(&self) -> Option<Duration> {
        non_zero_millis(self.read_deadline_ms)
    }

    pub fn write_deadline(&self) -> Option<Duration> {
        non_zero_millis(self.write_deadline_ms)
    }

    pub fn send_buff_timeout(&self) -> Duration {
        Duration::from_millis(self.send_buff_timeout_ms)
    }

    pub fn worker_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.worker_monitor_interval_ms.max(1))
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_conn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_conn: 12000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub reconnect_wait_time_ms: u64,
    /// 0 retries forever
    pub max_reconnect_count: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_wait_time_ms: 1000,
            max_reconnect_count: 0,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_wait_time(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_time_ms)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoneNetConfig {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl StoneNetConfig {
    /// Loads the config file, then applies `STONENET__<SECTION>__<KEY>` environment overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<StoneNetConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("STONENET")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let stonenet_config: StoneNetConfig = config.try_deserialize()?;

        Ok(stonenet_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_file() -> AppResult<()> {
        let mut file = NamedTempFile::with_suffix(".toml")?;
        writeln!(
            file,
            r#"
[service]
ip_version = "tcp6"
addr = "[::1]:4000"
worker_pool_size = 0
byte_order = "big"

[server]
max_conn = 3
"#
        )?;

        let config = StoneNetConfig::set_up_config(file.path())?;
        assert_eq!(config.service.ip_version, IpVersion::Tcp6);
        assert_eq!(config.service.addr, "[::1]:4000");
        assert_eq!(config.service.worker_pool_size, 0);
        assert_eq!(config.service.byte_order, ByteOrder::Big);
        // untouched keys keep their defaults
        assert_eq!(config.service.max_worker_task_len, 1024);
        assert_eq!(config.service.max_packet_size, 4096);
        assert_eq!(config.service.read_deadline(), None);
        assert_eq!(config.server.max_conn, 3);
        assert_eq!(config.client.max_reconnect_count, 0);
        Ok(())
    }

    #[test]
    fn test_missing_config_file() {
        let result = StoneNetConfig::set_up_config("/nonexistent/stonenet.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }

    #[test]
    fn test_deadlines() {
        let config = ServiceConfig {
            read_deadline_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.read_deadline(), Some(Duration::from_millis(250)));
        assert_eq!(config.write_deadline(), None);
        assert_eq!(config.send_buff_timeout(), Duration::from_millis(5));
    }
}
