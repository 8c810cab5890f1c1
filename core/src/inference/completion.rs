//! Asynchronous submission and completion handoff.
//!
//! [`submit`] threads a typed context through the server and hands it back
//! together with the response. [`infer`] builds the common promise style
//! on top of it: the context is the sending half of a one-shot channel and
//! the caller keeps a [`ResponseFuture`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

use super::request::InferenceRequest;
use super::response::InferenceResponse;
use crate::error::{InferError, Result};
use crate::memory::ResponseAllocator;
use crate::server::InferenceServer;

/// Completion notification handed to [`InferenceServer::infer_async`].
pub type CompletionFn = Box<dyn FnOnce(InferenceResponse) + Send + 'static>;

/// Submit `request` and deliver `context` back to `on_complete` with the
/// response.
///
/// Returns once the server has accepted or rejected the request. On
/// acceptance `on_complete` runs exactly once, on a server thread. On
/// rejection it never runs and `context` is dropped.
pub fn submit<S, C, F>(
    server: &S,
    request: InferenceRequest,
    allocator: Arc<dyn ResponseAllocator>,
    context: C,
    on_complete: F,
) -> Result<()>
where
    S: InferenceServer + ?Sized,
    C: Send + 'static,
    F: FnOnce(C, InferenceResponse) + Send + 'static,
{
    server.infer_async(
        request,
        allocator,
        Box::new(move |response| on_complete(context, response)),
    )
}

/// Pending result of a request submitted with [`infer`].
///
/// Either block on it with [`wait`](Self::wait) or `.await` it. To bound
/// the wait, await it under a deadline such as `tokio::time::timeout`;
/// the server keeps working on the request after the deadline fires and
/// the late response is released when it arrives.
#[derive(Debug)]
pub struct ResponseFuture {
    id: u64,
    rx: oneshot::Receiver<InferenceResponse>,
}

impl ResponseFuture {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the current thread until the response arrives.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<InferenceResponse> {
        let id = self.id;
        self.rx
            .blocking_recv()
            .map_err(|_| InferError::CompletionDropped(id))
    }
}

impl Future for ResponseFuture {
    type Output = Result<InferenceResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| InferError::CompletionDropped(id)))
    }
}

/// Submit `request` and return a future for its response.
pub fn infer<S>(
    server: &S,
    request: InferenceRequest,
    allocator: Arc<dyn ResponseAllocator>,
) -> Result<ResponseFuture>
where
    S: InferenceServer + ?Sized,
{
    let id = request.id();
    let (tx, rx) = oneshot::channel();
    submit(server, request, allocator, tx, move |tx, response| {
        if tx.send(response).is_err() {
            debug!("response for request {} arrived after its waiter left", id);
        }
    })?;
    Ok(ResponseFuture { id, rx })
}
