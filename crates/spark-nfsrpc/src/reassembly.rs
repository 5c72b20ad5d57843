//! 字节流记录标记的分帧与重组。
//!
//! # 教案式注释
//! - **意图 (Why)**：字节流不保留消息边界，RPC over TCP 在每条记录前附加 4 字节大端标记，
//!   最高位为“最后分片”位，其余 31 位为长度。
//! - **逻辑 (How)**：[`RecordReassembler`] 在 `ExpectMarker` 与 `ExpectBody` 两个状态间切换，
//!   累积缓冲使用 `BytesMut`，完整记录以 `split_to` 零拷贝切出。
//! - **契约 (What)**：长度为 0 或超过上限即判定失步，返回 [`RpcError::ProtocolDesync`]；
//!   调用者此后必须丢弃连接并重连，重组器随建连被 [`RecordReassembler::reset`]。
//! - **注意事项 (Trade-offs)**：最后分片位被忽略，每个分片按独立记录交付，
//!   与常见 NFS 服务端“一条应答一个分片”的行为一致。

use crate::error::RpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 记录标记中的“最后分片”位。
pub const LAST_FRAGMENT: u32 = 0x8000_0000;
const MARKER_LEN: usize = 4;
const WORD: usize = std::mem::align_of::<u32>();

/// 重组状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReassemblyState {
    ExpectMarker,
    ExpectBody { residual: usize },
}

/// 流式记录重组器。
#[derive(Debug)]
pub struct RecordReassembler {
    state: ReassemblyState,
    buffer: BytesMut,
    max_record_len: usize,
}

impl RecordReassembler {
    pub fn new(max_record_len: usize) -> Self {
        Self {
            state: ReassemblyState::ExpectMarker,
            buffer: BytesMut::new(),
            max_record_len,
        }
    }

    /// 回到初始状态并丢弃残留字节；每次建连时调用。
    pub fn reset(&mut self) {
        self.state = ReassemblyState::ExpectMarker;
        self.buffer.clear();
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// 已缓冲但尚未组成记录的字节数。
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 追加一段接收到的字节。
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// 取出下一条完整记录；字节不足时返回 `Ok(None)`。
    pub fn next_record(&mut self) -> Result<Option<Bytes>, RpcError> {
        loop {
            match self.state {
                ReassemblyState::ExpectMarker => {
                    if self.buffer.len() < MARKER_LEN {
                        return Ok(None);
                    }
                    let length = self.buffer.get_u32() & !LAST_FRAGMENT;
                    if length == 0 || length as usize > self.max_record_len {
                        self.buffer.clear();
                        return Err(RpcError::ProtocolDesync {
                            length,
                            max: self.max_record_len,
                        });
                    }
                    self.state = ReassemblyState::ExpectBody {
                        residual: length as usize,
                    };
                }
                ReassemblyState::ExpectBody { residual } => {
                    if self.buffer.len() < residual {
                        return Ok(None);
                    }
                    let record = self.buffer.split_to(residual).freeze();
                    self.state = ReassemblyState::ExpectMarker;
                    return Ok(Some(record));
                }
            }
        }
    }
}

/// 为一条完整请求加上记录标记。
pub fn frame_record(payload: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(MARKER_LEN + payload.len());
    framed.put_u32(LAST_FRAGMENT | payload.len() as u32);
    framed.put_slice(payload);
    framed.freeze()
}

/// 保证记录起始地址按字对齐且长度为字的整数倍。
///
/// 不满足时复制到新分配的缓冲，内容与长度保持不变；第二个返回值指示是否发生了复制。
pub fn normalize_alignment(record: Bytes) -> (Bytes, bool) {
    let aligned = (record.as_ptr() as usize) % WORD == 0 && record.len() % WORD == 0;
    if aligned {
        return (record, false);
    }
    let mut copy = BytesMut::with_capacity(record.len().next_multiple_of(WORD));
    copy.extend_from_slice(&record);
    (copy.freeze(), true)
}
