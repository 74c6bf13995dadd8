//! Where spliced pipes get spawned: inline on the caller's runtime by
//! default, or on a dedicated multi-thread pool when a config's
//! `forwarder_threads` says to carve one out. Mirrors the original's
//! optional `io_threadpool` that pipe work could be rebound onto.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};
use tracing::info;

#[derive(Clone)]
pub enum PipeExecutor {
    /// Spawn onto whatever runtime the caller is already running on.
    Inline,
    /// Spawn onto a dedicated multi-thread runtime. The `Arc<Runtime>` is
    /// held here so the pool stays alive as long as any clone of this
    /// executor does.
    Dedicated {
        handle: Handle,
        runtime: Arc<Runtime>,
    },
}

impl PipeExecutor {
    /// `forwarder_threads <= 0` means "auto": run pipes on the ambient
    /// runtime. `> 0` spins up a dedicated pool with that many worker
    /// threads that every pipe on this controller/server gets spawned onto.
    pub fn from_forwarder_threads(forwarder_threads: i32) -> Self {
        if forwarder_threads <= 0 {
            return PipeExecutor::Inline;
        }

        let worker_threads = forwarder_threads as usize;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("zrp-forwarder")
            .enable_all()
            .build()
            .expect("failed to build forwarder thread pool");
        info!(worker_threads, "dedicated forwarder thread pool started");
        let handle = runtime.handle().clone();
        PipeExecutor::Dedicated {
            handle,
            runtime: Arc::new(runtime),
        }
    }

    /// Spawn a pipe task onto this executor.
    pub fn spawn_pipe<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            PipeExecutor::Inline => {
                tokio::spawn(fut);
            }
            PipeExecutor::Dedicated { handle, .. } => {
                handle.spawn(fut);
            }
        }
    }
}
