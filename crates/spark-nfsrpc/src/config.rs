//! 挂载选项：传输类型、重试策略、定时器节拍与通知阈值。
//!
//! # 教案式注释
//! - **意图 (Why)**：会话的全部可调参数集中在 [`MountOptions`]，既可由代码构造，也可从
//!   TOML 片段加载，便于运维侧声明式配置。
//! - **逻辑 (How)**：字段使用 `serde(default)` 回落到经典 NFS 客户端的缺省值；
//!   [`MountOptions::validate`] 在会话建立前拒绝非法组合。
//! - **契约 (What)**：超时以“节拍数”表达，节拍长度由 `tick_ms` 决定；所有 RTT 估计
//!   都以节拍为单位。
//! - **注意事项 (Trade-offs)**：节拍越短，定时器唤醒越频繁；缺省 10ms 与历史实现保持一致。

use crate::error::ConfigError;
use crate::transport::TransportKind;
use serde::Deserialize;
use std::time::Duration;

/// 缺省重传次数（软挂载预算）。
pub const DEFAULT_RETRANS: u32 = 10;
/// 缺省定时器节拍长度（毫秒）。
pub const DEFAULT_TICK_MS: u64 = 10;
/// 缺省初始超时：1 秒，以节拍计。
pub const DEFAULT_TIMEO_TICKS: u32 = 100;
/// 单条记录的最大长度：RPC 头部预留 404 字节 + 32 KiB 数据。
pub const DEFAULT_MAX_RECORD_LEN: usize = 404 + 32_768;
/// 定时器可接受的最大超时：60 秒（以缺省节拍计）。
pub const MAX_TIMEO_TICKS: u32 = 6_000;

/// 会话级挂载选项。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MountOptions {
    /// 服务端展示名，用于日志与连通性通知。
    pub server: String,
    pub transport: TransportKind,
    /// 软挂载：重传预算耗尽后以超时失败；硬挂载则无限重试。
    pub soft: bool,
    pub retrans: u32,
    /// 可中断挂载：允许调用方通过取消令牌中止等待。
    pub interruptible: bool,
    /// 固定超时模式：不做 RTT 估计，也不受拥塞窗口约束。
    pub dumb_timer: bool,
    pub timeo_ticks: u32,
    pub tick_ms: u64,
    pub max_record_len: usize,
    /// 首次“服务端无响应”提示前需等待的秒数；0 关闭提示。
    pub tprintf_initial_delay_secs: u64,
    /// 同一请求两次提示之间的最小间隔（秒）。
    pub tprintf_delay_secs: u64,
    pub reconnect_delay_ms: u64,
    /// 重连尝试上限；`None` 表示持续重试直至成功、取消或致命错误。
    pub reconnect_attempts: Option<u32>,
    pub nfs_version: u8,
    /// NFSERR_TRYLATER 的初始等待（秒），之后按退避表放大。
    pub try_later_delay_secs: u64,
    pub drain_attempts: u32,
    pub drain_interval_ms: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            server: String::from("nfs-server"),
            transport: TransportKind::Datagram,
            soft: false,
            retrans: DEFAULT_RETRANS,
            interruptible: false,
            dumb_timer: false,
            timeo_ticks: DEFAULT_TIMEO_TICKS,
            tick_ms: DEFAULT_TICK_MS,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            tprintf_initial_delay_secs: 12,
            tprintf_delay_secs: 30,
            reconnect_delay_ms: 1_000,
            reconnect_attempts: None,
            nfs_version: 3,
            try_later_delay_secs: 15,
            drain_attempts: 30,
            drain_interval_ms: 1_000,
        }
    }
}

impl MountOptions {
    /// 以指定传输类型构造缺省选项。
    pub fn new(server: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            server: server.into(),
            transport,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析并校验。
    ///
    /// ```
    /// use spark_nfsrpc::{MountOptions, TransportKind};
    ///
    /// let opts = MountOptions::from_toml_str(
    ///     "server = \"filer:/export\"\ntransport = \"stream\"\nsoft = true\nretrans = 3\n",
    /// )
    /// .unwrap();
    /// assert_eq!(opts.transport, TransportKind::Stream);
    /// assert_eq!(opts.retrans, 3);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: MountOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// 校验字段组合。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::invalid("tick_ms", "tick period must be non-zero"));
        }
        if self.timeo_ticks == 0 || self.timeo_ticks > MAX_TIMEO_TICKS {
            return Err(ConfigError::invalid(
                "timeo_ticks",
                format!("must lie in 1..={MAX_TIMEO_TICKS}, got {}", self.timeo_ticks),
            ));
        }
        if self.soft && self.retrans == 0 {
            return Err(ConfigError::invalid("retrans", "soft mounts need a retransmit budget"));
        }
        if self.max_record_len < 8 || self.max_record_len > 0x7fff_ffff {
            return Err(ConfigError::invalid(
                "max_record_len",
                format!("{} cannot hold an rpc reply", self.max_record_len),
            ));
        }
        if !matches!(self.nfs_version, 2 | 3) {
            return Err(ConfigError::invalid(
                "nfs_version",
                format!("unsupported version {}", self.nfs_version),
            ));
        }
        if self.reconnect_attempts == Some(0) {
            return Err(ConfigError::invalid("reconnect_attempts", "must allow at least one attempt"));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn try_later_delay(&self) -> Duration {
        Duration::from_secs(self.try_later_delay_secs)
    }

    pub fn tprintf_initial_delay(&self) -> Duration {
        Duration::from_secs(self.tprintf_initial_delay_secs)
    }

    pub fn tprintf_delay(&self) -> Duration {
        Duration::from_secs(self.tprintf_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let opts = MountOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.tick(), Duration::from_millis(10));
        assert!(!opts.soft);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let opts = MountOptions::from_toml_str(
            r#"
            server = "filer:/vol0"
            transport = "datagram"
            interruptible = true
            timeo_ticks = 50
            reconnect_attempts = 4
            "#,
        )
        .expect("parse");
        assert_eq!(opts.server, "filer:/vol0");
        assert!(opts.interruptible);
        assert_eq!(opts.timeo_ticks, 50);
        assert_eq!(opts.reconnect_attempts, Some(4));
        assert_eq!(opts.retrans, DEFAULT_RETRANS);
    }

    #[test]
    fn rejects_invalid_combinations() {
        let mut opts = MountOptions {
            soft: true,
            retrans: 0,
            ..MountOptions::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::Invalid { field: "retrans", .. })
        ));
        opts.retrans = 2;
        opts.timeo_ticks = 0;
        assert!(opts.validate().is_err());
        opts.timeo_ticks = 10;
        opts.nfs_version = 4;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = MountOptions::from_toml_str("rsize = 8192").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
