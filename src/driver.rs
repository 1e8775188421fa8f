use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::hw::adapter::AdapterEvent;
use crate::tag::{ConnectionState, ConnectionStateMachine};

/// Single consumer feeding adapter events to one [`ConnectionStateMachine`].
///
/// The machine is `!Send`, so [`ConnectionDriver::run`] must be spawned with
/// [`tokio::task::spawn_local`] or awaited inside a
/// [`tokio::task::LocalSet`].
#[derive(Debug)]
pub struct ConnectionDriver {
    machine: ConnectionStateMachine,
    events: UnboundedReceiver<AdapterEvent>,
    cancel: CancellationToken,
}

impl ConnectionDriver {
    #[must_use]
    pub fn new(
        machine: ConnectionStateMachine,
        events: UnboundedReceiver<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine,
            events,
            cancel,
        }
    }

    #[must_use]
    pub fn machine(&self) -> &ConnectionStateMachine {
        &self.machine
    }

    /// Handles adapter events until cancelled or the event channel closes,
    /// then destroys the machine and returns its last state.
    #[instrument(skip(self), fields(address = %self.machine.address()))]
    pub async fn run(mut self) -> ConnectionState {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("connection driver cancelled");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("adapter event channel closed");
                        break;
                    };
                    self.machine.on_state_event(&event);
                }
            }
        }

        let last = self.machine.current();
        self.machine.destroy();
        last
    }
}
