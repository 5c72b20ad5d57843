//! 调用描述、请求编帧与应答信封解析。
//!
//! # 教案式注释
//! - **意图 (Why)**：过程参数/结果的编解码与认证头构造不属于引擎；引擎只负责把 xid 写进
//!   请求、在流链路上加记录标记，并剥开 ONC RPC 应答信封判断成功与否。
//! - **逻辑 (How)**：调用方提供 xid 之后的全部字节（`msg_type` 起）；[`decode_reply`] 依次
//!   校验 `reply_stat`、跳过校验器、检查 `accept_stat`，再读取 NFS 状态字。
//! - **契约 (What)**：成功时 [`RpcReply::results`] 指向状态字之后的过程结果；
//!   状态字非零时返回 [`RpcError::Application`]，NFSv3 附带结果体。

use crate::congestion::TimerClass;
use crate::error::RpcError;
use crate::reassembly::frame_record;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// 服务端繁忙，稍后整次重试（NFSv3）。
pub const NFSERR_TRYLATER: u32 = 10_013;
/// 文件句柄已失效。
pub const NFSERR_STALE: u32 = 70;

const REPLY_MSG_ACCEPTED: u32 = 0;
const REJECT_RPC_MISMATCH: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const MAX_AUTH_BYTES: usize = 400;

type StaleHook = Arc<dyn Fn() + Send + Sync>;

/// 一次 RPC 调用的描述。
#[derive(Clone)]
pub struct RpcCall {
    body: Bytes,
    class: TimerClass,
    on_stale: Option<StaleHook>,
}

impl RpcCall {
    /// `body` 为 xid 之后的完整调用消息（调用头、认证信息与过程参数）。
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            class: TimerClass::Default,
            on_stale: None,
        }
    }

    /// 按 NFS 过程号选择计时类别。
    pub fn for_procedure(procedure: u32, body: impl Into<Bytes>) -> Self {
        Self::new(body).with_class(TimerClass::for_nfs_procedure(procedure))
    }

    pub fn with_class(mut self, class: TimerClass) -> Self {
        self.class = class;
        self
    }

    /// 服务端报告句柄失效时执行的缓存清理动作。
    pub fn on_stale_handle(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stale = Some(Arc::new(hook));
        self
    }

    pub fn class(&self) -> TimerClass {
        self.class
    }

    pub(crate) fn body(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn stale_handle(&self) {
        if let Some(hook) = &self.on_stale {
            hook();
        }
    }
}

impl fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("len", &self.body.len())
            .field("class", &self.class)
            .field("on_stale", &self.on_stale.is_some())
            .finish()
    }
}

/// 成功的 RPC 应答。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcReply {
    xid: u32,
    message: Bytes,
    results_at: usize,
}

impl RpcReply {
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// 完整应答消息（含信封）。
    pub fn message(&self) -> &Bytes {
        &self.message
    }

    /// 状态字之后的过程结果。
    pub fn results(&self) -> Bytes {
        self.message.slice(self.results_at..)
    }
}

/// 拼出线上请求：xid + 调用体，流链路再加记录标记。
pub(crate) fn encode_call(xid: u32, body: &[u8], record_marking: bool) -> Bytes {
    let mut message = BytesMut::with_capacity(4 + body.len());
    message.put_u32(xid);
    message.put_slice(body);
    if record_marking {
        frame_record(&message)
    } else {
        message.freeze()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn word(&mut self) -> Result<u32, RpcError> {
        let bytes = self
            .buf
            .get(self.at..self.at + 4)
            .ok_or(RpcError::Malformed("truncated reply"))?;
        self.at += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, len: usize) -> Result<(), RpcError> {
        if self.at + len > self.buf.len() {
            return Err(RpcError::Malformed("truncated verifier"));
        }
        self.at += len;
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.at >= self.buf.len()
    }
}

/// 剥开应答信封。
pub fn decode_reply(message: Bytes, nfs_version: u8) -> Result<RpcReply, RpcError> {
    let mut cursor = Cursor {
        buf: &message,
        at: 0,
    };
    let xid = cursor.word()?;
    if cursor.word()? != 1 {
        return Err(RpcError::Malformed("not a reply"));
    }
    if cursor.word()? != REPLY_MSG_ACCEPTED {
        let reject = cursor.word()?;
        return Err(RpcError::Denied {
            mismatch: reject == REJECT_RPC_MISMATCH,
        });
    }
    let _flavor = cursor.word()?;
    let verifier_len = cursor.word()? as usize;
    if verifier_len > MAX_AUTH_BYTES {
        return Err(RpcError::Malformed("verifier too long"));
    }
    cursor.skip(verifier_len.next_multiple_of(4))?;
    let accept = cursor.word()?;
    if accept != ACCEPT_SUCCESS {
        return Err(RpcError::Unaccepted { stat: accept });
    }
    if cursor.is_exhausted() {
        let results_at = cursor.at;
        return Ok(RpcReply {
            xid,
            message,
            results_at,
        });
    }
    let status = cursor.word()?;
    let results_at = cursor.at;
    if status != 0 {
        let reply = (nfs_version == 3).then(|| message.slice(results_at..));
        return Err(RpcError::Application { status, reply });
    }
    Ok(RpcReply {
        xid,
        message,
        results_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(xid: u32, verifier: &[u8], status: Option<u32>, results: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u32(xid);
        out.put_u32(1);
        out.put_u32(0);
        out.put_u32(0);
        out.put_u32(verifier.len() as u32);
        out.put_slice(verifier);
        out.put_bytes(0, verifier.len().next_multiple_of(4) - verifier.len());
        out.put_u32(0);
        if let Some(status) = status {
            out.put_u32(status);
        }
        out.put_slice(results);
        out.freeze()
    }

    #[test]
    fn success_exposes_results() {
        let reply = decode_reply(accepted(9, b"abc", Some(0), b"RESULTS!"), 3).expect("ok");
        assert_eq!(reply.xid(), 9);
        assert_eq!(&reply.results()[..], b"RESULTS!");
    }

    #[test]
    fn null_procedure_has_no_status() {
        let reply = decode_reply(accepted(3, b"", None, b""), 3).expect("ok");
        assert!(reply.results().is_empty());
    }

    #[test]
    fn nfs_errors_keep_body_on_v3_only() {
        let wire = accepted(4, b"", Some(NFSERR_STALE), b"wcc");
        match decode_reply(wire.clone(), 3) {
            Err(RpcError::Application { status, reply }) => {
                assert_eq!(status, NFSERR_STALE);
                assert_eq!(reply.as_deref(), Some(&b"wcc"[..]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            decode_reply(wire, 2),
            Err(RpcError::Application { reply: None, .. })
        ));
    }

    #[test]
    fn denied_and_unaccepted() {
        let mut denied = BytesMut::new();
        for word in [5u32, 1, 1, 0, 2, 3] {
            denied.put_u32(word);
        }
        assert!(matches!(
            decode_reply(denied.freeze(), 3),
            Err(RpcError::Denied { mismatch: true })
        ));

        let mut unaccepted = BytesMut::new();
        for word in [6u32, 1, 0, 0, 0, 1] {
            unaccepted.put_u32(word);
        }
        assert!(matches!(
            decode_reply(unaccepted.freeze(), 3),
            Err(RpcError::Unaccepted { stat: 1 })
        ));
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let wire = accepted(1, b"", Some(0), b"");
        assert!(matches!(
            decode_reply(wire.slice(..10), 3),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn stream_requests_are_record_marked() {
        let wire = encode_call(0x0102_0304, b"body", true);
        assert_eq!(&wire[..4], &(0x8000_0000u32 | 8).to_be_bytes());
        assert_eq!(&wire[4..8], &[1, 2, 3, 4]);
        assert_eq!(&wire[8..], b"body");
        assert_eq!(encode_call(7, b"x", false).len(), 5);
    }
}
