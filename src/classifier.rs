//! Gender classification.
//!
//! The engine treats the classifier as a black box mapping a user's tweet text to a label. Labels are single
//! tokens (`0` or `1` for the bundled model) written verbatim into `<key> <label>` files.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::process;

use log;

/// Classifier error.
#[derive(Debug)]
pub enum ClassifierError {
    /// Communication with the classifier failed.
    IO(io::Error),
    /// The classifier process could not be started.
    Spawn { command: String, source: io::Error },
    /// The classifier stopped answering.
    Closed { command: String, status: Option<i32> },
    /// The classifier returned something that is not a single token label.
    InvalidLabel(String),
}

impl Error for ClassifierError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ClassifierError::IO(err) => Some(err),
            ClassifierError::Spawn { source, .. } => Some(source),
            ClassifierError::Closed { .. } => None,
            ClassifierError::InvalidLabel(_) => None,
        }
    }
}

impl Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ClassifierError::IO(err) => write!(f, "classifier I/O failed: {}", err),
            ClassifierError::Spawn { command, source } => {
                write!(f, "classifier command `{}` could not be started: {}", command, source)
            }
            ClassifierError::Closed { command, status } => write!(
                f,
                "classifier command `{}` stopped answering (exit status: {})",
                command,
                status.map_or_else(|| "unknown".to_string(), |code| code.to_string())
            ),
            ClassifierError::InvalidLabel(label) => write!(f, "invalid classifier label: {:?}", label),
        }
    }
}

impl From<io::Error> for ClassifierError {
    fn from(err: io::Error) -> Self {
        ClassifierError::IO(err)
    }
}

/// Text to label classifier.
pub trait GenderClassifier: Send {
    fn predict(&mut self, text: &str) -> Result<String, ClassifierError>;
}

/// Adapts a closure into a [`GenderClassifier`].
pub struct FnClassifier<F>(pub F);

impl<F> GenderClassifier for FnClassifier<F>
where
    F: FnMut(&str) -> String + Send,
{
    fn predict(&mut self, text: &str) -> Result<String, ClassifierError> {
        validate_label((self.0)(text))
    }
}

fn validate_label(label: String) -> Result<String, ClassifierError> {
    let trimmed = label.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(ClassifierError::InvalidLabel(label));
    }
    return Ok(trimmed.to_string());
}

/// Classifier running as a long-lived child process.
///
/// The command is run through `sh -c`. Every request is one line of text on the child's stdin (line breaks inside
/// the text are replaced with spaces) and every answer is one label line on its stdout.
pub struct CommandClassifier {
    command: String,
    child: process::Child,
    stdin: io::BufWriter<process::ChildStdin>,
    stdout: io::BufReader<process::ChildStdout>,
    answer: String,
}

impl CommandClassifier {
    pub fn spawn(command: &str) -> Result<Self, ClassifierError> {
        log::info!("starting classifier: {}", command);

        let spawn_error = |source| ClassifierError::Spawn {
            command: command.to_string(),
            source,
        };
        let mut child = process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(process::Stdio::piped())
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(spawn_error(io::Error::new(io::ErrorKind::Other, "child pipes unavailable")));
            }
        };

        return Ok(CommandClassifier {
            command: command.to_string(),
            child,
            stdin: io::BufWriter::new(stdin),
            stdout: io::BufReader::new(stdout),
            answer: String::new(),
        });
    }

    fn closed(&mut self) -> ClassifierError {
        let status = self.child.try_wait().ok().flatten().and_then(|status| status.code());
        ClassifierError::Closed {
            command: self.command.clone(),
            status,
        }
    }
}

impl GenderClassifier for CommandClassifier {
    fn predict(&mut self, text: &str) -> Result<String, ClassifierError> {
        let request = text.replace(|c: char| c == '\n' || c == '\r', " ");
        let sent = writeln!(self.stdin, "{}", request).and_then(|_| self.stdin.flush());
        if let Err(err) = sent {
            return Err(match err.kind() {
                io::ErrorKind::BrokenPipe => self.closed(),
                _ => ClassifierError::IO(err),
            });
        }

        self.answer.clear();
        if self.stdout.read_line(&mut self.answer)? == 0 {
            return Err(self.closed());
        }

        validate_label(std::mem::take(&mut self.answer))
    }
}

impl Drop for CommandClassifier {
    fn drop(&mut self) {
        let _ = self.stdin.flush();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
