use tokio::sync::broadcast;
use tracing::debug;

use crate::probe::ConnectionStatus;

/// Events this core raises towards the application layer (and between its own modules where a
///  direct call would invert ownership).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoreEvent {
    /// The reachability probe moved to a new step or verdict.
    ConnectionStatusChanged {
        status: ConnectionStatus,
        auto_configure: bool,
    },

    /// The probe reached a verdict and the directory knows our external address: friend
    ///  connections can start in earnest.
    ConnectionReady,

    /// The cached friend list changed (directory sync).
    FriendsChanged,

    /// A logical connection to this friend was established.
    FriendOnline(u32),

    /// The logical connection to this friend was lost.
    FriendOffline(u32),
}

/// Fan-out for [CoreEvent]s. Subscribers come and go; events sent with no subscribers present
///  are dropped silently.
pub struct CoreEventNotifier {
    sender: broadcast::Sender<CoreEvent>,
}

impl Default for CoreEventNotifier {
    fn default() -> Self {
        CoreEventNotifier::new()
    }
}

impl CoreEventNotifier {
    pub fn new() -> CoreEventNotifier {
        let (sender, _) = broadcast::channel(64);
        CoreEventNotifier { sender }
    }

    pub fn send_event(&self, event: CoreEvent) {
        debug!("core event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}
