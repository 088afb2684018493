//! Stage-driven actions: maps a session's stage to one externally visible
//! action and delivers it through a notification channel.

pub mod dispatcher;
pub mod notify;
pub mod templates;

pub use dispatcher::{ActionDispatcher, DispatchOutcome};
pub use notify::{
    ChannelError, DeliveryReceipt, LogChannel, Notification, NotificationChannel,
    RecordingChannel, WebhookChannel,
};
