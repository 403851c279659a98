//! 边读边算指纹
//!
//! 上传流经 [`HashingReader`] 时同步计算 MD5，写入去重日志的指纹
//! 就是实际发送给后端的字节的指纹，与上传期间源文件是否继续被写入无关。

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Default)]
struct HashState {
    context: Option<md5::Context>,
    bytes: u64,
}

/// 读取结束后获取指纹
#[derive(Clone)]
pub struct HashHandle {
    state: Arc<Mutex<HashState>>,
}

impl HashHandle {
    /// 已读取的字节数
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// 已读取内容的 MD5（十六进制）
    pub fn finish(&self) -> String {
        let mut state = self.state.lock();
        let context = state.context.take().unwrap_or_else(md5::Context::new);
        format!("{:x}", context.compute())
    }
}

/// 计算读取内容指纹的读取器
pub struct HashingReader<R> {
    inner: R,
    state: Arc<Mutex<HashState>>,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> (Self, HashHandle) {
        let state = Arc::new(Mutex::new(HashState {
            context: Some(md5::Context::new()),
            bytes: 0,
        }));
        let handle = HashHandle {
            state: state.clone(),
        };
        (Self { inner, state }, handle)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &poll {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                let mut state = this.state.lock();
                if let Some(context) = state.context.as_mut() {
                    context.consume(read);
                }
                state.bytes += read.len() as u64;
            }
        }
        poll
    }
}
