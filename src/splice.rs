// The contents of this file are derived from
// <https://github.com/saiko-tech/mmproxy-rs/blob/9fdd5ed9d532dee9b62dafb592acecc6da33dc5f/src/listener/tcp.rs#L129>
// which is provided under the MIT License and is
// Copyright (c) 2022 Saiko Technology Ltd.
//!
//! Direction-pump primitives for splice mode (spec §4.5). On Linux, plain
//! TCP-to-TCP forwarding uses the `splice(2)` syscall to move bytes
//! through a kernel pipe without a userspace copy. Everything else
//! (non-Linux, or either side TLS-wrapped) uses `adaptive_copy`, a
//! fixed-size buffer that grows from 1 KiB to 1 MiB as sustained throughput
//! demands it, per spec §4.5.

use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Starting size for the adaptive buffer fallback (spec §4.5).
pub const ADAPTIVE_BUF_START: usize = 1024;
/// Ceiling for the adaptive buffer fallback (spec §4.5).
pub const ADAPTIVE_BUF_MAX: usize = 1024 * 1024;

/// Copies `src` to `dst` with a buffer that starts small and doubles each
/// time a read fills it completely, capping at `ADAPTIVE_BUF_MAX`. Returns
/// the total bytes copied once `src` reaches EOF.
pub async fn adaptive_copy<R, W>(src: &mut R, dst: &mut W) -> IoResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; ADAPTIVE_BUF_START];
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            dst.flush().await?;
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;

        if n == buf.len() && buf.len() < ADAPTIVE_BUF_MAX {
            let new_len = (buf.len() * 2).min(ADAPTIVE_BUF_MAX);
            buf.resize(new_len, 0);
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_splice::splice_copy;

#[cfg(target_os = "linux")]
mod linux_splice {
    use super::*;
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;
    use tokio::net::tcp::{ReadHalf, WriteHalf};

    /// 1MB pipe buffer (spec §4.5's "max 1 MiB", mirrored for the kernel
    /// pipe that backs the zero-copy path).
    const PIPE_BUF_SIZE: usize = 1024 * 1024;

    /// Uses `splice(2)` to move bytes from `src` to `dst` via a kernel pipe
    /// buffer, eliminating the userspace copy. Only valid for plain TCP
    /// sockets; TLS-wrapped streams must use `adaptive_copy`.
    pub async fn splice_copy(src: &mut ReadHalf<'_>, dst: &mut WriteHalf<'_>) -> IoResult<u64> {
        let pipe = Pipe::new()?;
        let mut size = 0;
        let mut done = false;
        let mut total = 0u64;

        let src_ref = src.as_ref();
        let dst_ref = dst.as_ref();
        let src_fd = src_ref.as_raw_fd();
        let dst_fd = dst_ref.as_raw_fd();

        while !done {
            if size == 0 {
                src_ref.readable().await?;
            }
            let ret = src_ref.try_io(Interest::READABLE, || {
                while size < PIPE_BUF_SIZE {
                    let r = splice(src_fd, pipe.w, PIPE_BUF_SIZE - size)?;
                    if r == 0 {
                        done = true;
                        break;
                    }
                    size += r;
                }
                Ok(())
            });
            if let Err(err) = ret {
                if err.kind() != IoErrorKind::WouldBlock {
                    return if done { Ok(total) } else { Err(err) };
                }
            }

            if size == 0 {
                continue;
            }

            dst_ref.writable().await?;
            let ret = dst_ref.try_io(Interest::WRITABLE, || {
                while size > 0 {
                    let r = splice(pipe.r, dst_fd, size)?;
                    size -= r;
                    total += r as u64;
                }
                Ok(())
            });
            if let Err(err) = ret {
                if err.kind() != IoErrorKind::WouldBlock {
                    return if done { Ok(total) } else { Err(err) };
                }
            }
        }

        Ok(total)
    }

    #[derive(Debug)]
    struct Pipe {
        r: i32,
        w: i32,
    }

    impl Pipe {
        fn new() -> IoResult<Self> {
            let pipes = unsafe {
                let mut pipes = std::mem::MaybeUninit::<[libc::c_int; 2]>::uninit();
                if libc::pipe2(
                    pipes.as_mut_ptr().cast(),
                    libc::O_NONBLOCK | libc::O_CLOEXEC,
                ) < 0
                {
                    return Err(IoError::last_os_error());
                }
                pipes.assume_init()
            };

            unsafe {
                if libc::fcntl(pipes[0], libc::F_SETPIPE_SZ, PIPE_BUF_SIZE) < 0 {
                    libc::close(pipes[0]);
                    libc::close(pipes[1]);
                    return Err(IoError::last_os_error());
                }
            }

            Ok(Self {
                r: pipes[0],
                w: pipes[1],
            })
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.r);
                libc::close(self.w);
            }
        }
    }

    fn splice(r: i32, w: i32, n: usize) -> IoResult<usize> {
        let result = unsafe {
            libc::splice(
                r,
                std::ptr::null_mut(),
                w,
                std::ptr::null_mut(),
                n,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };

        if result >= 0 {
            return Ok(result as usize);
        }

        let err = IoError::last_os_error();
        let errno = err.raw_os_error().unwrap_or(0);
        if (errno == libc::EWOULDBLOCK || errno == libc::EAGAIN)
            && err.kind() != IoErrorKind::WouldBlock
        {
            Err(IoError::new(IoErrorKind::WouldBlock, "EWOULDBLOCK"))
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn adaptive_copy_forwards_all_bytes() {
        let (mut client, mut server) = duplex(64 * 1024);
        let payload = vec![7u8; 200_000];
        let payload_clone = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload_clone).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut sink = Vec::new();
        let total = adaptive_copy(&mut server, &mut sink).await.unwrap();

        writer.await.unwrap();
        assert_eq!(total, payload.len() as u64);
        assert_eq!(sink, payload);
    }

    #[tokio::test]
    async fn adaptive_copy_grows_buffer_on_sustained_throughput() {
        let (mut client, mut server) = duplex(8 * ADAPTIVE_BUF_MAX);
        let payload = vec![1u8; 4 * ADAPTIVE_BUF_MAX];
        let payload_clone = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload_clone).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut sink = Vec::new();
        let total = adaptive_copy(&mut server, &mut sink).await.unwrap();
        writer.await.unwrap();
        assert_eq!(total, payload.len() as u64);
    }
}
