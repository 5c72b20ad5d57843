//! 事务号分配。

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 单调递增、跳过 0 的 xid 发生器；起点随机化以避免重启后与旧应答撞号。
#[derive(Debug)]
pub(crate) struct XidAllocator {
    next: AtomicU32,
}

impl XidAllocator {
    pub(crate) fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub(crate) fn seeded() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self::starting_at((mix64(nanos) >> 32) as u32)
    }

    /// 下一个候选 xid；唯一性由注册表在持锁状态下复核。
    pub(crate) fn next_candidate(&self) -> u32 {
        loop {
            let xid = self.next.fetch_add(1, Ordering::Relaxed);
            if xid != 0 {
                return xid;
            }
        }
    }
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_past_zero() {
        let xids = XidAllocator::starting_at(u32::MAX);
        assert_eq!(xids.next_candidate(), u32::MAX);
        assert_eq!(xids.next_candidate(), 1);
        assert_eq!(xids.next_candidate(), 2);
    }
}
