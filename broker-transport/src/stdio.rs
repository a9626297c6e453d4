//! Process stdin/stdout as a line channel.

use crate::line::{LineReceiver, LineSender, line_channel};

/// Frames the process's stdin and stdout as a single line channel.
///
/// Logs must not go to stdout while this channel is in use.
#[must_use]
pub fn stdio_channel(max_frame_bytes: usize) -> (LineSender, LineReceiver) {
    line_channel(
        tokio::io::stdin(),
        tokio::io::stdout(),
        "stdio",
        max_frame_bytes,
    )
}
