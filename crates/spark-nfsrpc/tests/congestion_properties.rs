//! 拥塞窗口与 RTT 估计的性质测试。
//!
//! # 教案式注释
//! - **意图 (Why)**：窗口与估计值被接收路径、定时器和调用路径交错修改，单个用例难以覆盖
//!   所有交错顺序；这里用随机事件序列驱动 [`CongestionState`]，检查任何顺序下都成立的不变量。
//! - **逻辑 (How)**：影子计数 `outstanding` 跟踪已计入窗口的请求数，只有存在已发送请求时才
//!   生成“已发送应答”，与注册表的 Sent 标记语义一致。
//! - **契约 (What)**：
//!   1. `CWND_SCALE <= cwnd <= MAX_CWND`；
//!   2. `sent == outstanding × CWND_SCALE`；
//!   3. 连续超时计数不超过退避表长度，任一类别的超时至少一个节拍。

use proptest::prelude::*;
use spark_nfsrpc::{BACKOFF, CWND_SCALE, CongestionState, MAX_CWND, TimerClass};

#[derive(Clone, Debug)]
enum Event {
    Charge,
    Reply { sent: bool, class: TimerClass, rtt: i32 },
    Retransmit,
    Timeout,
    Reconnect,
}

fn class() -> impl Strategy<Value = TimerClass> {
    prop_oneof![
        Just(TimerClass::Default),
        Just(TimerClass::GetAttr),
        Just(TimerClass::Lookup),
        Just(TimerClass::Read),
        Just(TimerClass::Write),
    ]
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => Just(Event::Charge),
        3 => (any::<bool>(), class(), 0..2_000i32)
            .prop_map(|(sent, class, rtt)| Event::Reply { sent, class, rtt }),
        1 => Just(Event::Retransmit),
        1 => Just(Event::Timeout),
        1 => Just(Event::Reconnect),
    ]
}

const ALL_CLASSES: [TimerClass; 5] = [
    TimerClass::Default,
    TimerClass::GetAttr,
    TimerClass::Lookup,
    TimerClass::Read,
    TimerClass::Write,
];

proptest! {
    #[test]
    fn prop_window_stays_bounded(
        timeo in 1u32..=6_000,
        events in proptest::collection::vec(event(), 1..200),
    ) {
        let mut state = CongestionState::new(timeo);
        let mut outstanding = 0u32;
        for event in events {
            match event {
                Event::Charge => {
                    state.charge_send();
                    outstanding += 1;
                }
                Event::Reply { sent, class, rtt } => {
                    let was_sent = sent && outstanding > 0;
                    if was_sent {
                        outstanding -= 1;
                    }
                    let sample = class.is_timed().then_some((class, rtt));
                    state.on_reply(was_sent, sample);
                    prop_assert_eq!(state.timeouts(), 0);
                }
                Event::Retransmit => state.on_retransmit(),
                Event::Timeout => state.note_timeout(),
                Event::Reconnect => state.reset_on_connect(),
            }
            prop_assert!(state.cwnd() >= CWND_SCALE);
            prop_assert!(state.cwnd() <= MAX_CWND);
            prop_assert_eq!(state.sent(), outstanding * CWND_SCALE);
            prop_assert!(state.timeouts() as usize <= BACKOFF.len());
            for class in ALL_CLASSES {
                prop_assert!(state.compute_timeout(class, false) >= 1);
            }
        }
    }

    #[test]
    fn prop_timeout_backoff_is_monotonic(timeo in 1u32..=6_000, class in class()) {
        let mut state = CongestionState::new(timeo);
        let mut previous = state.compute_timeout(class, false);
        for _ in 0..BACKOFF.len() + 2 {
            state.note_timeout();
            let next = state.compute_timeout(class, false);
            prop_assert!(next >= previous);
            previous = next;
        }
        prop_assert_eq!(state.timeouts() as usize, BACKOFF.len());
    }

    #[test]
    fn prop_dumb_timer_ignores_estimates(
        timeo in 1u32..=6_000,
        samples in proptest::collection::vec(0..500i32, 0..20),
    ) {
        let mut state = CongestionState::new(timeo);
        for rtt in samples {
            state.on_reply(false, Some((TimerClass::Read, rtt)));
        }
        for class in ALL_CLASSES {
            prop_assert_eq!(state.compute_timeout(class, true), timeo as i32);
        }
    }
}

#[test]
fn additive_increase_needs_a_full_window() {
    let mut state = CongestionState::new(100);
    for _ in 0..15 {
        state.charge_send();
    }
    state.on_reply(true, None);
    assert_eq!(state.cwnd(), MAX_CWND / 2);

    let mut state = CongestionState::new(100);
    for _ in 0..16 {
        state.charge_send();
    }
    state.on_reply(true, None);
    assert_eq!(state.cwnd(), 4_112);
    assert_eq!(state.sent(), 15 * CWND_SCALE);
}
