//! Snapshot stream for one session

use super::session::Session;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Lazy, finite sequence of session snapshots. Ends after the terminal
/// snapshot, or when the run goes away without producing one.
#[derive(Debug)]
pub struct SessionStream {
    session_id: String,
    rx: mpsc::Receiver<Session>,
    done: bool,
}

impl SessionStream {
    pub(crate) fn new(session_id: String, rx: mpsc::Receiver<Session>) -> Self {
        Self {
            session_id,
            rx,
            done: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Stream for SessionStream {
    type Item = Session;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(snapshot)) => {
                if snapshot.is_terminal() {
                    self.done = true;
                    self.rx.close();
                }
                Poll::Ready(Some(snapshot))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
