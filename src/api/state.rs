use tokio::sync::{mpsc, watch};

use crate::monitor::MonitorEvent;
use crate::status::StatusSnapshot;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    /// Latest published snapshot. May lag the loop by one tick.
    pub snapshots: watch::Receiver<StatusSnapshot>,
    /// Inbox of the control loop, for submitted fix descriptors.
    pub events: mpsc::Sender<MonitorEvent>,
}
