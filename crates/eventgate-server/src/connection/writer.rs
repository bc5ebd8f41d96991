//! Transport-specific frame output.

use async_trait::async_trait;
use eventgate_core::{CloseCode, Message, Result};

/// Sink for outbound frames of one connection.
///
/// Callers serialize access; implementations never see two concurrent calls.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one protocol message.
    async fn write_message(&mut self, message: &Message) -> Result<()>;

    /// Send the transport-level close with `code`.
    async fn write_close(&mut self, code: CloseCode) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use eventgate_core::{CloseCode, GatewayError, Message, Result};
    use parking_lot::Mutex;

    use super::FrameWriter;

    #[derive(Default)]
    struct State {
        buffer: Mutex<String>,
        closes: Mutex<Vec<CloseCode>>,
        fail: AtomicBool,
    }

    /// Records frames as newline-separated JSON.
    ///
    /// Each frame is appended in small chunks with a yield in between, so
    /// unserialized concurrent writers would interleave and corrupt lines.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        state: Arc<State>,
    }

    impl Recorder {
        pub(crate) fn writer(&self) -> Box<dyn FrameWriter> {
            Box::new(RecordingWriter {
                state: Arc::clone(&self.state),
            })
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            self.state
                .buffer
                .lock()
                .lines()
                .map(str::to_string)
                .collect()
        }

        pub(crate) fn messages(&self) -> Vec<Message> {
            self.lines()
                .iter()
                .map(|line| Message::from_json(line).unwrap())
                .collect()
        }

        pub(crate) fn close_codes(&self) -> Vec<CloseCode> {
            self.state.closes.lock().clone()
        }

        pub(crate) fn fail_writes(&self) {
            self.state.fail.store(true, Ordering::SeqCst);
        }
    }

    struct RecordingWriter {
        state: Arc<State>,
    }

    #[async_trait]
    impl FrameWriter for RecordingWriter {
        async fn write_message(&mut self, message: &Message) -> Result<()> {
            if self.state.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::transport("broken pipe"));
            }
            let json = message.to_json()?;
            let chars: Vec<char> = json.chars().collect();
            for chunk in chars.chunks(8) {
                self.state.buffer.lock().extend(chunk.iter());
                tokio::task::yield_now().await;
            }
            self.state.buffer.lock().push('\n');
            Ok(())
        }

        async fn write_close(&mut self, code: CloseCode) -> Result<()> {
            self.state.closes.lock().push(code);
            if self.state.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::transport("broken pipe"));
            }
            Ok(())
        }
    }
}
