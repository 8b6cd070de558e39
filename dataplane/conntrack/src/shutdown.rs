/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Error, Result};

/// Cancels `cancel` on the first SIGINT or SIGTERM.
///
/// Both handlers are installed before this returns. The listener ends
/// without a signal once `cancel` fires elsewhere.
pub fn cancel_on_shutdown_signal(cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt()).map_err(Error::SignalHandlerError)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(Error::SignalHandlerError)?;

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = received, "received shutdown signal");
        cancel.cancel();
    }))
}
