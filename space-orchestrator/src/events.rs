//! Line-oriented progress events emitted while a space is provisioned.

use futures_util::stream::{self, Stream};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    InvalidImage,
    QuotaExceeded,
    NoHostsAvailable,
    NoPortsAvailable,
    CreateFailed,
    Internal,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidImage => "Invalid Image",
            Self::QuotaExceeded => "Quota Exceeded",
            Self::NoHostsAvailable => "No Hosts Available",
            Self::NoPortsAvailable => "No Ports Available",
            Self::CreateFailed => "Error Creating Container",
            Self::Internal => "Internal Error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionEvent {
    HostChosen,
    PortsSecured,
    ContainerCreated,
    /// Sent whether or not the container started; the space status tells which.
    CreationComplete,
    Failed(FailureReason),
    TimedOut,
}

impl ProvisionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CreationComplete | Self::Failed(_) | Self::TimedOut
        )
    }
}

impl fmt::Display for ProvisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostChosen => f.write_str("Host Chosen"),
            Self::PortsSecured => f.write_str("Ports Secured"),
            Self::ContainerCreated => f.write_str("Container Created"),
            Self::CreationComplete => f.write_str("Creation Complete"),
            Self::Failed(reason) => write!(f, "Error: {reason}"),
            Self::TimedOut => f.write_str("Error: Timed Out"),
        }
    }
}

/// Producer half. Each send waits at most `idle_timeout` for the consumer;
/// after the first timeout the sink is abandoned and later events are dropped.
pub struct EventSink {
    tx: mpsc::Sender<ProvisionEvent>,
    idle_timeout: Duration,
    abandoned: AtomicBool,
}

impl EventSink {
    pub async fn emit(&self, event: ProvisionEvent) {
        if self.is_abandoned() {
            debug!(%event, "Dropping event for abandoned stream");
            return;
        }

        match self.tx.send_timeout(event, self.idle_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(event)) => {
                warn!(
                    %event,
                    timeout_secs = self.idle_timeout.as_secs_f64(),
                    "Provisioning stream not consumed, abandoning it"
                );
                self.abandoned.store(true, Ordering::SeqCst);
            }
            Err(SendTimeoutError::Closed(event)) => {
                debug!(%event, "Provisioning stream receiver dropped");
                self.abandoned.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Consumer half. Always ends with a terminal event: if the producer goes
/// away without sending one, a [`ProvisionEvent::TimedOut`] is yielded.
pub struct ProvisionStream {
    rx: mpsc::Receiver<ProvisionEvent>,
    finished: bool,
}

impl ProvisionStream {
    pub async fn next(&mut self) -> Option<ProvisionEvent> {
        if self.finished {
            return None;
        }

        let event = self.rx.recv().await.unwrap_or(ProvisionEvent::TimedOut);
        if event.is_terminal() {
            self.finished = true;
            self.rx.close();
        }
        Some(event)
    }

    /// Drain the stream into its textual lines.
    pub async fn collect_lines(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(event) = self.next().await {
            lines.push(event.to_string());
        }
        lines
    }

    /// Adapt into a `Stream` of lines for forwarding to a remote client.
    pub fn into_lines(self) -> impl Stream<Item = String> + Send {
        stream::unfold(self, |mut events| async move {
            let event = events.next().await?;
            Some((event.to_string(), events))
        })
    }
}

/// Create a connected sink/stream pair.
pub fn channel(idle_timeout: Duration) -> (EventSink, ProvisionStream) {
    // Capacity 1 so an absent consumer is noticed at the next event.
    let (tx, rx) = mpsc::channel(1);
    (
        EventSink {
            tx,
            idle_timeout,
            abandoned: AtomicBool::new(false),
        },
        ProvisionStream {
            rx,
            finished: false,
        },
    )
}
