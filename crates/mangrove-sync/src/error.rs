use thiserror::Error;

use crate::supervisor::SlotEvent;

/// The scheduler's error surface is deliberately narrow: unsolicited blocks
/// and store rejections are recovered locally and only logged, so the one
/// thing that can actually fail a caller is the supervisor's event channel.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Error while writing into a channel")]
    ChannelSend(#[from] tokio::sync::mpsc::error::SendError<SlotEvent>),
}
