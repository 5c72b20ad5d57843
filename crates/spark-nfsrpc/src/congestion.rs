//! 拥塞窗口与 RTT 估计器。
//!
//! # 教案式注释
//! - **意图 (Why)**：数据报传输没有内建流控，客户端必须自行限制在途请求数，并依据
//!   实测往返时间决定何时重传。
//! - **逻辑 (How)**：
//!   - `cwnd`/`sent` 都以 [`CWND_SCALE`] 为单位缩放，整数运算即可表达“半个请求”的增量；
//!   - 每个计时类别维护一对 `(srtt, sdrtt)`，分别放大 8 倍与 4 倍保存，按 Jacobson 算法更新；
//!   - 连续超时计数驱动 [`BACKOFF`] 指数退避表。
//! - **契约 (What)**：
//!   - `cwnd ∈ [CWND_SCALE, MAX_CWND]` 恒成立；
//!   - `sent` 只通过 [`CongestionState::charge_send`] / [`CongestionState::release_send`]
//!     变动，调用者保证它与注册表中 Sent 标记数 × `CWND_SCALE` 相等。
//! - **注意事项 (Trade-offs)**：所有时间量以定时器节拍计，精度受 `tick_ms` 限制。

use crate::transport::TransportKind;

/// 窗口缩放因子：一个在途请求占用的窗口量。
pub const CWND_SCALE: u32 = 256;
/// 窗口上限：32 个在途请求。
pub const MAX_CWND: u32 = CWND_SCALE * 32;
/// 单个请求的重传计数上限。
pub const MAX_REXMIT: u32 = 100;
/// 连续超时退避表，按 `timeouts - 1` 索引。
pub const BACKOFF: [i32; 8] = [2, 4, 8, 16, 32, 64, 128, 256];

/// 决定超时公式与 RTT 统计槽位的请求类别。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// 不计时，使用挂载的静态超时。
    #[default]
    Default,
    GetAttr,
    Lookup,
    Read,
    Write,
}

impl TimerClass {
    /// 按 NFSv3 过程号选择类别。
    pub fn for_nfs_procedure(procedure: u32) -> Self {
        match procedure {
            1 | 4 => TimerClass::GetAttr,
            3 => TimerClass::Lookup,
            5 | 6 | 16 | 17 => TimerClass::Read,
            7 => TimerClass::Write,
            _ => TimerClass::Default,
        }
    }

    /// 该类别的请求是否参与 RTT 采样。
    pub fn is_timed(self) -> bool {
        self.slot().is_some()
    }

    fn slot(self) -> Option<usize> {
        match self {
            TimerClass::Default => None,
            TimerClass::GetAttr => Some(0),
            TimerClass::Lookup => Some(1),
            TimerClass::Read => Some(2),
            TimerClass::Write => Some(3),
        }
    }
}

/// 估计器状态的只读快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CongestionSnapshot {
    pub cwnd: u32,
    pub sent: u32,
    pub timeouts: u32,
    pub srtt: [i32; 4],
    pub sdrtt: [i32; 4],
}

/// 会话级拥塞与 RTT 状态。
#[derive(Clone, Debug)]
pub struct CongestionState {
    cwnd: u32,
    sent: u32,
    srtt: [i32; 4],
    sdrtt: [i32; 4],
    timeouts: u32,
    timeo: i32,
}

impl CongestionState {
    /// 以静态超时（节拍）初始化。
    pub fn new(timeo_ticks: u32) -> Self {
        let timeo = i32::try_from(timeo_ticks).unwrap_or(i32::MAX >> 4);
        let mut state = Self {
            cwnd: MAX_CWND / 2,
            sent: 0,
            srtt: [0; 4],
            sdrtt: [0; 4],
            timeouts: 0,
            timeo,
        };
        state.reset_on_connect();
        state
    }

    /// 每次建连成功后重置估计；`sent` 保持不变，因为已发送的请求仍在注册表中。
    pub fn reset_on_connect(&mut self) {
        self.srtt = [self.timeo << 3; 4];
        self.sdrtt = [0; 4];
        self.cwnd = MAX_CWND / 2;
        self.timeouts = 0;
    }

    /// 准入判定：数据报受窗口约束，面向连接的链路总是放行。
    pub fn admit(&self, kind: TransportKind, dumb_timer: bool) -> bool {
        kind.is_connection_oriented() || dumb_timer || self.sent < self.cwnd
    }

    /// 窗口是否仍有余量，供定时器重发首发请求时判断。
    pub fn has_room(&self) -> bool {
        self.sent < self.cwnd
    }

    /// 请求首次成功发出：占用一个窗口单位。
    pub fn charge_send(&mut self) {
        self.sent += CWND_SCALE;
    }

    /// 已发送请求离开窗口（收到应答、软终止或注销）。
    pub fn release_send(&mut self) {
        debug_assert!(self.sent >= CWND_SCALE, "sent underflow");
        self.sent = self.sent.saturating_sub(CWND_SCALE);
    }

    /// 处理一条匹配成功的应答。
    ///
    /// `was_sent` 对应请求的 Sent 标记；`sample` 在请求仍处于计时状态时给出
    /// `(类别, 已流逝节拍)`。
    pub fn on_reply(&mut self, was_sent: bool, sample: Option<(TimerClass, i32)>) {
        if self.cwnd <= self.sent {
            self.cwnd += (CWND_SCALE * CWND_SCALE + (self.cwnd >> 1)) / self.cwnd;
            self.cwnd = self.cwnd.min(MAX_CWND);
        }
        if was_sent {
            self.release_send();
        }
        if let Some((class, rtt)) = sample
            && let Some(slot) = class.slot()
        {
            let mut delta = rtt + 1;
            delta -= self.srtt[slot] >> 3;
            self.srtt[slot] += delta;
            let delta = delta.abs() - (self.sdrtt[slot] >> 2);
            self.sdrtt[slot] += delta;
        }
        self.timeouts = 0;
    }

    /// 计算当前类别的超时（节拍），已叠加连续超时退避。
    pub fn compute_timeout(&self, class: TimerClass, dumb_timer: bool) -> i32 {
        let base = if dumb_timer { self.timeo } else { self.rto(class) };
        match self.timeouts {
            0 => base,
            n => base.saturating_mul(BACKOFF[(n as usize - 1).min(BACKOFF.len() - 1)]),
        }
    }

    fn rto(&self, class: TimerClass) -> i32 {
        match class.slot() {
            None => self.timeo,
            Some(slot) => {
                let (srtt, sdrtt) = (self.srtt[slot], self.sdrtt[slot]);
                if matches!(class, TimerClass::GetAttr | TimerClass::Lookup) {
                    (((srtt + 3) >> 2) + sdrtt + 1) >> 1
                } else {
                    ((srtt + 7) >> 3) + sdrtt + 1
                }
            }
        }
    }

    /// 记录一次超时，最多累积到退避表长度。
    pub fn note_timeout(&mut self) {
        if (self.timeouts as usize) < BACKOFF.len() {
            self.timeouts += 1;
        }
    }

    /// 已发送请求被重发：窗口减半，下限一个单位。
    pub fn on_retransmit(&mut self) {
        self.cwnd = (self.cwnd >> 1).max(CWND_SCALE);
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn snapshot(&self) -> CongestionSnapshot {
        CongestionSnapshot {
            cwnd: self.cwnd,
            sent: self.sent,
            timeouts: self.timeouts,
            srtt: self.srtt,
            sdrtt: self.sdrtt,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_window(&mut self, cwnd: u32, sent: u32) {
        self.cwnd = cwnd;
        self.sent = sent;
    }
}
