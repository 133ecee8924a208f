use anyhow::{anyhow, Context, Result};
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use shipit_installer::InstallPhase;

use crate::protocol::{ResultMessage, ServerMessage, WireRequest};

/// Sends `request` to the service at `socket` and waits for its terminal
/// result, reporting each phase to `on_progress` as it arrives.
///
/// The connection stays fully open until the result is read; closing it
/// earlier cancels the install unless `survive_disconnect` is set.
pub async fn submit<Progress>(
    socket: &Path,
    request: &WireRequest,
    mut on_progress: Progress,
) -> Result<ResultMessage>
where
    Progress: FnMut(InstallPhase),
{
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to installer at {}", socket.display()))?;
    let (reader, mut writer) = stream.into_split();

    writer
        .write_all(request.encode()?.as_bytes())
        .await
        .context("failed to send install request")?;
    writer.flush().await.context("failed to send install request")?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read from installer")?
    {
        if line.trim().is_empty() {
            continue;
        }
        match ServerMessage::decode(&line)? {
            ServerMessage::Progress { phase } => on_progress(phase),
            ServerMessage::Result(result) => return Ok(result),
        }
    }

    Err(anyhow!("installer closed the connection without a result"))
}
