pub mod reader;
pub mod sender;
pub mod monitoring;

pub use reader::{
    Reader,
    ReaderState,
    DrainCondition,
};
pub use sender::{
    sender,
    ChannelSender,
    SendSummary,
};
pub use monitoring::monitoring;
