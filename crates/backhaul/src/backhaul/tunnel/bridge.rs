use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Splices two connections, each given as a `(reader, writer)` pair.
///
/// Both directions run concurrently. As soon as one of them hits end-of-stream
/// or an error the other is dropped and both writers are shut down; the halves
/// are consumed, so both connections are closed when this returns.
pub async fn bridge<AR, AW, BR, BW>(a: (AR, AW), b: (BR, BW)) -> BridgeStats
where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = a;
    let (mut br, mut bw) = b;

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    {
        let up = pump(&mut ar, &mut bw, &a_to_b);
        let down = pump(&mut br, &mut aw, &b_to_a);
        tokio::select! {
            res = up => {
                if let Err(err) = res {
                    tracing::debug!(err=%err, "bridge: a->b ended with error");
                }
            }
            res = down => {
                if let Err(err) = res {
                    tracing::debug!(err=%err, "bridge: b->a ended with error");
                }
            }
        }
    }

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;

    let stats = BridgeStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    };
    metrics::counter!("backhaul_bridge_bytes_total", "direction" => "a_to_b")
        .increment(stats.a_to_b);
    metrics::counter!("backhaul_bridge_bytes_total", "direction" => "b_to_a")
        .increment(stats.b_to_a);
    stats
}

async fn pump<R, W>(r: &mut R, w: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
