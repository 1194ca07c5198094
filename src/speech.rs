use std::io;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Reads completed assistant text aloud.
pub trait SpeechOutput: Send + Sync {
    /// Starts speaking `text`, cancelling whatever is currently being spoken.
    fn speak(&self, text: &str);

    fn cancel(&self);
}

/// Speech output for hosts without a text-to-speech engine.
pub struct NoSpeech;

impl SpeechOutput for NoSpeech {
    fn speak(&self, _text: &str) {}

    fn cancel(&self) {}
}

/// Speaks through an external program such as `espeak` or `say`, which
/// receives the text as its last argument.
pub struct CommandSpeech {
    program: String,
    args: Vec<String>,
    // Dropping the sender stops the utterance it belongs to.
    current: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandSpeech {
    /// Parses a whitespace-separated command line, e.g. `espeak -s 180`.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
            current: Mutex::new(None),
        })
    }

    fn spawn(&self, text: &str) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Waits for the speech process so it is reaped as soon as it exits, or kills
/// it once `cancelled` fires.
async fn supervise(mut child: Child, cancelled: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if !status.success() => {
                tracing::debug!(%status, "speech command exited with failure");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "failed to wait for speech command"),
        },
        _ = cancelled => {
            if let Err(err) = child.kill().await {
                tracing::debug!(error = %err, "speech command already gone");
            }
        }
    }
}

impl SpeechOutput for CommandSpeech {
    fn speak(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("speech needs a tokio runtime");
            return;
        };

        let Ok(mut current) = self.current.lock() else {
            return;
        };
        current.take();

        // Command::spawn registers the child with the runtime's reactor.
        let _entered = runtime.enter();
        match self.spawn(text) {
            Ok(child) => {
                let (cancel, cancelled) = oneshot::channel();
                runtime.spawn(supervise(child, cancelled));
                *current = Some(cancel);
            }
            Err(err) => {
                tracing::warn!(program = %self.program, error = %err, "speech synthesis failed")
            }
        }
    }

    fn cancel(&self) {
        if let Ok(mut current) = self.current.lock() {
            current.take();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every utterance instead of speaking it.
    #[derive(Default)]
    pub(crate) struct RecordingSpeech {
        spoken: Mutex<Vec<String>>,
    }

    impl RecordingSpeech {
        pub(crate) fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    impl SpeechOutput for RecordingSpeech {
        fn speak(&self, text: &str) {
            self.spoken.lock().unwrap().push(text.to_string());
        }

        fn cancel(&self) {}
    }

    #[test]
    fn command_line_splits_program_and_args() {
        let speech = CommandSpeech::from_command_line("espeak -s 180").unwrap();
        assert_eq!(speech.program, "espeak");
        assert_eq!(speech.args, vec!["-s", "180"]);
    }

    #[test]
    fn blank_command_line_is_rejected() {
        assert!(CommandSpeech::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn finished_utterance_is_reaped() {
        let (_cancel, cancelled) = oneshot::channel();
        let child = Command::new("true").spawn().unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervise(child, cancelled),
        )
        .await
        .expect("speech process was not reaped");
    }

    #[tokio::test]
    async fn cancel_kills_running_utterance() {
        let speech = CommandSpeech::from_command_line("sleep").unwrap();
        let child = speech.spawn("30").unwrap();
        let (cancel, cancelled) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, cancelled));

        *speech.current.lock().unwrap() = Some(cancel);
        speech.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(5), supervisor)
            .await
            .expect("speech process was not killed")
            .unwrap();
    }

    #[test]
    fn speak_outside_runtime_is_a_no_op() {
        let speech = CommandSpeech::from_command_line("relaychat-no-such-voice").unwrap();
        speech.speak("hello");
        assert!(speech.current.lock().unwrap().is_none());
    }
}
