//! Unit of work flowing from the engine through an endpoint to a connection.

use crate::error::{EngineError, Result};
use crate::types::{HttpRequestData, HttpResponse};
use tokio::sync::oneshot;

/// Where a task's outcome is delivered. Written at most once.
pub(crate) type ResponseSlot = oneshot::Sender<Result<HttpResponse>>;

/// A request together with the slot its result is written to.
///
/// The caller holds the receiving end. Dropping it cancels the task: a task
/// that has not been written yet is skipped, and one being written tears its
/// connection down.
#[derive(Debug)]
pub struct RequestTask {
    request: HttpRequestData,
    response: ResponseSlot,
}

impl RequestTask {
    /// Bind `request` to a fresh result slot.
    pub fn new(request: HttpRequestData) -> (Self, oneshot::Receiver<Result<HttpResponse>>) {
        let (response, receiver) = oneshot::channel();
        (RequestTask { request, response }, receiver)
    }

    /// Whether the request cannot share a pipelined connection.
    pub fn requires_dedicated_connection(&self) -> bool {
        self.request.requires_dedicated_connection()
    }

    /// Whether the caller stopped waiting for the result.
    pub fn is_cancelled(&self) -> bool {
        self.response.is_closed()
    }

    /// Resolves when the caller stops waiting for the result.
    pub async fn cancelled(&mut self) {
        self.response.closed().await
    }

    /// Complete the task with `error`.
    pub fn fail(self, error: EngineError) {
        let _ = self.response.send(Err(error));
    }

    pub(crate) fn into_parts(self) -> (HttpRequestData, ResponseSlot) {
        (self.request, self.response)
    }
}
