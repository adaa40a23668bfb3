//! Channel abstraction for chat I/O.

pub mod channel;
pub mod cli;
pub mod manager;
pub mod notifier;
pub mod telegram;

pub use channel::*;
pub use cli::CliChannel;
pub use manager::ChannelManager;
pub use notifier::JobNotifier;
pub use telegram::TelegramChannel;
