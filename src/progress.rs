use std::future::Future;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const TICK: Duration = Duration::from_millis(120);

/// Drives `future` to completion while drawing a spinner on stderr.
///
/// The spinner is redrawn on the same task whenever the tick interval fires
/// and the future is still pending, so nothing runs concurrently with the
/// request. When stderr is not a terminal the future is awaited as is.
pub async fn with_spinner<F: Future>(future: F) -> F::Output {
    if !io::stderr().is_terminal() {
        return future.await;
    }

    tokio::pin!(future);
    let mut ticker = tokio::time::interval(TICK);
    let mut frame = 0;

    let output = loop {
        tokio::select! {
            output = &mut future => break output,
            _ = ticker.tick() => {
                let mut stderr = io::stderr().lock();
                let _ = write!(stderr, "\r{}", FRAMES[frame % FRAMES.len()]);
                let _ = stderr.flush();
                frame += 1;
            }
        }
    };

    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "\r \r");
    let _ = stderr.flush();
    output
}
