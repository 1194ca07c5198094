//! Host integrations used by silent actions: the clipboard and the URL opener.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::io::{self, Write};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[async_trait]
pub trait Platform: Send + Sync {
    async fn write_clipboard(&self, text: &str) -> io::Result<()>;

    /// Used when the system clipboard is unavailable.
    async fn write_clipboard_fallback(&self, text: &str) -> io::Result<()>;

    async fn open_url(&self, url: &str) -> io::Result<()>;
}

/// Talks to the desktop through the usual command-line helpers.
pub struct SystemPlatform;

type HelperCommand = (&'static str, &'static [&'static str]);

const MACOS_CLIPBOARD: &[HelperCommand] = &[("pbcopy", &[])];
const WINDOWS_CLIPBOARD: &[HelperCommand] = &[("clip", &[])];
const UNIX_CLIPBOARD: &[HelperCommand] = &[
    ("wl-copy", &[]),
    ("xclip", &["-selection", "clipboard"]),
    ("xsel", &["--clipboard", "--input"]),
];

fn clipboard_commands() -> &'static [HelperCommand] {
    if cfg!(target_os = "macos") {
        MACOS_CLIPBOARD
    } else if cfg!(windows) {
        WINDOWS_CLIPBOARD
    } else {
        UNIX_CLIPBOARD
    }
}

async fn pipe_to(program: &str, args: &[&str], input: &str) -> io::Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{} exited with {}", program, status)))
    }
}

#[async_trait]
impl Platform for SystemPlatform {
    async fn write_clipboard(&self, text: &str) -> io::Result<()> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no clipboard helper found");
        for (program, args) in clipboard_commands() {
            match pipe_to(program, args, text).await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn write_clipboard_fallback(&self, text: &str) -> io::Result<()> {
        // OSC 52: ask the terminal emulator to set the clipboard.
        let mut stdout = io::stdout();
        write!(stdout, "\x1b]52;c;{}\x07", STANDARD.encode(text))?;
        stdout.flush()
    }

    async fn open_url(&self, url: &str) -> io::Result<()> {
        let status = if cfg!(target_os = "macos") {
            Command::new("open").arg(url).status().await?
        } else if cfg!(windows) {
            Command::new("cmd")
                .args(["/C", "start", "", url])
                .status()
                .await?
        } else {
            Command::new("xdg-open")
                .arg(url)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await?
        };

        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("opener exited with {}", status)))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingPlatform {
        clipboard_unavailable: bool,
        copied: Mutex<Vec<String>>,
        fallback_copied: Mutex<Vec<String>>,
        opened: Mutex<Vec<String>>,
    }

    impl RecordingPlatform {
        pub(crate) fn without_clipboard() -> Self {
            Self {
                clipboard_unavailable: true,
                ..Self::default()
            }
        }

        pub(crate) fn copied(&self) -> Vec<String> {
            self.copied.lock().unwrap().clone()
        }

        pub(crate) fn fallback_copied(&self) -> Vec<String> {
            self.fallback_copied.lock().unwrap().clone()
        }

        pub(crate) fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Platform for RecordingPlatform {
        async fn write_clipboard(&self, text: &str) -> io::Result<()> {
            if self.clipboard_unavailable {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no clipboard"));
            }
            self.copied.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn write_clipboard_fallback(&self, text: &str) -> io::Result<()> {
            self.fallback_copied.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn open_url(&self, url: &str) -> io::Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn pipe_to_missing_program_fails() {
        let err = pipe_to("relaychat-no-such-helper", &[], "x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
