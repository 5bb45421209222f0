// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer completion notifications.
//!
//! Each agent runs one background task that polls the requests callers asked
//! to be notified about and resolves a [`TransferCompleteNotification`] once
//! the request reaches a terminal state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, XferError};
use crate::request::{XferRequest, XferStatus};

/// Checks whether a tracked operation has finished.
pub trait CompletionChecker: Send {
    /// Returns true if the transfer is complete, false if still pending.
    fn is_complete(&self) -> Result<bool>;
}

/// Polls a transfer request owned by an agent.
pub(crate) struct RequestChecker {
    request: Arc<XferRequest>,
}

impl RequestChecker {
    pub(crate) fn new(request: Arc<XferRequest>) -> Self {
        Self { request }
    }
}

impl CompletionChecker for RequestChecker {
    fn is_complete(&self) -> Result<bool> {
        match self.request.status()? {
            XferStatus::Done => Ok(true),
            XferStatus::Error(e) => Err(e.into_xfer_error(self.request.backend_name())),
            XferStatus::Created | XferStatus::InProgress => Ok(false),
        }
    }
}

/// Registration message for polling-based transfer completion.
pub struct RegisterPollingNotification<C: CompletionChecker> {
    pub uuid: Uuid,
    pub checker: C,
    pub done: oneshot::Sender<Result<()>>,
}

struct OutstandingPollingTransfer<C: CompletionChecker> {
    checker: C,
    done: oneshot::Sender<Result<()>>,
    arrived_at: Instant,
    last_warned_at: Option<Instant>,
}

/// Returns the new last_warned_at time if a warning was issued.
fn check_and_warn_slow_transfer(
    uuid: &Uuid,
    arrived_at: Instant,
    last_warned_at: Option<Instant>,
    warn_after: Duration,
) -> Option<Instant> {
    let elapsed = arrived_at.elapsed();
    if elapsed > warn_after {
        let should_warn = last_warned_at
            .map(|last| last.elapsed() > warn_after / 2)
            .unwrap_or(true);

        if should_warn {
            warn!(
                uuid = %uuid,
                elapsed_secs = elapsed.as_secs(),
                "Transfer has been pending for over {} seconds",
                warn_after.as_secs()
            );
            return Some(Instant::now());
        }
    }
    last_warned_at
}

/// Polling loop serving notification registrations.
///
/// Runs until the sending side is dropped and every outstanding transfer has
/// been resolved.
pub async fn process_polling_notifications<C: CompletionChecker>(
    mut rx: mpsc::Receiver<RegisterPollingNotification<C>>,
    warn_after: Duration,
) {
    let mut outstanding: HashMap<Uuid, OutstandingPollingTransfer<C>> = HashMap::new();
    let mut check_interval = interval(Duration::from_millis(1));
    let mut open = true;

    while open || !outstanding.is_empty() {
        tokio::select! {
            notification = rx.recv(), if open => {
                match notification {
                    Some(notif) => {
                        outstanding.insert(notif.uuid, OutstandingPollingTransfer {
                            checker: notif.checker,
                            done: notif.done,
                            arrived_at: Instant::now(),
                            last_warned_at: None,
                        });
                    }
                    None => open = false,
                }
            }

            _ = check_interval.tick(), if !outstanding.is_empty() => {
                let mut completed = Vec::new();

                for (uuid, transfer) in outstanding.iter_mut() {
                    match transfer.checker.is_complete() {
                        Ok(true) => completed.push((*uuid, Ok(()))),
                        Ok(false) => {
                            transfer.last_warned_at = check_and_warn_slow_transfer(
                                uuid,
                                transfer.arrived_at,
                                transfer.last_warned_at,
                                warn_after,
                            );
                        }
                        Err(e) => {
                            warn!(uuid = %uuid, error = %e, "Transfer completed with an error");
                            completed.push((*uuid, Err(e)));
                        }
                    }
                }

                for (uuid, result) in completed {
                    if let Some(transfer) = outstanding.remove(&uuid) {
                        // receiver may be gone
                        let _ = transfer.done.send(result);
                    }
                }
            }
        }
    }
}

/// Notification handle for an in-flight transfer.
///
/// Await it, or call [`TransferCompleteNotification::wait`] from a thread that
/// is not driving a tokio runtime.
#[derive(Debug)]
pub struct TransferCompleteNotification {
    pub(crate) status: oneshot::Receiver<Result<()>>,
}

impl TransferCompleteNotification {
    /// A notification that resolves immediately with `result`.
    pub(crate) fn ready(result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { status: rx }
    }

    /// Block the current thread until the transfer finishes.
    pub fn wait(self) -> Result<()> {
        self.status.blocking_recv().map_err(|_| handler_dropped())?
    }
}

impl Future for TransferCompleteNotification {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.status)
            .poll(cx)
            .map(|result| result.map_err(|_| handler_dropped()).and_then(|r| r))
    }
}

fn handler_dropped() -> XferError {
    XferError::invalid_handle("transfer handler dropped before completion")
}
