//! Id types used by the relay.

use crate::define_id;

define_id!(
    /// One client connection (a terminal WebSocket).
    ChannelId,
    "chan"
);

define_id!(
    /// One bridged shell session. A channel may own several over its life,
    /// but only one at a time.
    SessionId,
    "sess"
);

define_id!(
    /// Correlates an HTTP request with its log lines and problem document.
    RequestId,
    "req"
);
