//! Display server with a logging sink and a synthetic renderer.
//!
//! Run with: cargo run --example render_sink [config.json]
//!
//! Starts a server, renders a gradient into it from a local client in
//! 32x32 buckets, prints the coverage reported by the sink, then waits for
//! further renderers until Ctrl-C.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

use dspy_server::protocol::{encode_image_data, encode_image_end};
use dspy_server::{
    DisplayServer, DisplaySink, FrameHandle, FramebufferDescriptor, HandshakeRequest,
    PixelByteOrder, Rect, Rgba, ServerConfig,
};

// ============================================================================
// LoggingSink
// ============================================================================

#[derive(Default)]
struct LoggingSink {
    next: AtomicU64,
    sizes: Mutex<FxHashMap<FrameHandle, (u32, u32)>>,
}

impl DisplaySink for LoggingSink {
    fn begin_frame(&self, x0: u32, y0: u32, width: u32, height: u32) -> FrameHandle {
        let handle = FrameHandle::new(self.next.fetch_add(1, Ordering::Relaxed));
        self.sizes.lock().insert(handle, (width, height));
        info!(%handle, x0, y0, width, height, "begin_frame");
        handle
    }

    fn update_frame(&self, handle: FrameHandle, pixels: &[Rgba]) {
        let lit = pixels.iter().filter(|p| p[3] > 0.0).count();
        let mean: f32 = pixels.iter().map(|p| p[0]).sum::<f32>() / pixels.len().max(1) as f32;
        info!(%handle, lit, total = pixels.len(), mean_red = mean, "update_frame");
    }

    fn end_frame(&self, handle: FrameHandle) {
        let size = self.sizes.lock().remove(&handle);
        info!(%handle, ?size, "end_frame");
    }
}

// ============================================================================
// Synthetic Renderer
// ============================================================================

async fn render_gradient(addr: std::net::SocketAddr, side: u32) -> anyhow::Result<()> {
    let descriptor = FramebufferDescriptor::rgba(0, side - 1, 0, side - 1);
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(&HandshakeRequest::new("gradient", descriptor).encode()?)
        .await?;

    let mut ready = [0u8; 4];
    stream.read_exact(&mut ready).await?;

    const BUCKET: u32 = 32;
    for y in (0..side).step_by(BUCKET as usize) {
        for x in (0..side).step_by(BUCKET as usize) {
            let rect = Rect::new(x, (x + BUCKET).min(side) - 1, y, (y + BUCKET).min(side) - 1);
            let mut samples = Vec::with_capacity(rect.area() as usize * 4);
            for py in rect.ymin..=rect.ymax {
                for px in rect.xmin..=rect.xmax {
                    // Wire order: alpha first.
                    samples.extend([
                        1.0,
                        px as f32 / side as f32,
                        py as f32 / side as f32,
                        0.5,
                    ]);
                }
            }
            stream
                .write_all(&encode_image_data(rect, &samples, PixelByteOrder::Little))
                .await?;
        }
    }

    stream.write_all(&encode_image_end()).await?;
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dspy_server=debug".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::new().with_port(0),
    };

    let server = DisplayServer::new(config, Arc::new(LoggingSink::default()))?
        .with_idle_hook(Arc::new(|| info!("All renderers finished")));
    let addr = server.start().await?;

    render_gradient(addr, 200).await?;

    info!(%addr, "Waiting for renderers, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
