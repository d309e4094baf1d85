//! Two external processes joined by an OS pipe.
//!
//! The producer's stdout is handed straight to the consumer's stdin; the
//! bytes never pass through this process. Once both are running our copy of
//! the pipe is closed, so a consumer that exits early leaves the producer
//! with a broken pipe (SIGPIPE) instead of a writer blocked forever.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::error::{FerryError, Result};

/// An argv vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute `{name}` placeholders in every argument.
    pub fn from_template(template: &[String], vars: &Placeholders) -> Self {
        Self {
            argv: template.iter().map(|arg| vars.expand(arg)).collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn command(&self) -> Result<Command> {
        let (program, rest) = self
            .argv
            .split_first()
            .ok_or_else(|| FerryError::Config("empty command line".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(rest);
        Ok(cmd)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// Values for `{name}` placeholders in command templates.
#[derive(Debug, Default, Clone)]
pub struct Placeholders(HashMap<&'static str, String>);

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(name, value.into());
        self
    }

    pub fn with_path(self, name: &'static str, path: &Path) -> Self {
        self.with(name, path.to_string_lossy().into_owned())
    }

    fn expand(&self, arg: &str) -> String {
        let mut out = arg.to_string();
        for (name, value) in &self.0 {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }
}

/// Run `producer | consumer` and wait for both.
///
/// The consumer's exit status decides success. A producer that failed for
/// any reason other than SIGPIPE is an error as well, since a truncated
/// input can still let the consumer exit cleanly.
pub fn run_pipeline(producer: &CommandLine, consumer: &CommandLine) -> Result<()> {
    tracing::debug!("pipeline: {producer} | {consumer}");

    let mut first = spawn(
        producer,
        producer
            .command()?
            .stdin(Stdio::null())
            .stdout(Stdio::piped()),
    )?;
    let pipe = first
        .stdout
        .take()
        .ok_or_else(|| FerryError::Config(format!("`{producer}` has no stdout")))?;

    let second = {
        let mut cmd = consumer.command()?;
        cmd.stdin(Stdio::from(pipe));
        // `cmd` holds the read end until it is dropped at the end of this
        // block; the consumer keeps its own copy.
        spawn(consumer, &mut cmd)
    };
    let mut second = match second {
        Ok(child) => child,
        Err(e) => {
            let _ = first.kill();
            let _ = first.wait();
            return Err(e);
        }
    };

    let consumer_status = second.wait()?;
    let producer_status = first.wait()?;

    if !consumer_status.success() {
        return Err(FerryError::Pipeline {
            command: consumer.to_string(),
            code: consumer_status.code(),
        });
    }
    if !producer_status.success() && !killed_by_sigpipe(&producer_status) {
        return Err(FerryError::Pipeline {
            command: producer.to_string(),
            code: producer_status.code(),
        });
    }
    Ok(())
}

fn spawn(line: &CommandLine, cmd: &mut Command) -> Result<Child> {
    cmd.spawn().map_err(|source| FerryError::Spawn {
        command: line.to_string(),
        source,
    })
}

#[cfg(unix)]
fn killed_by_sigpipe(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGPIPE)
}

#[cfg(not(unix))]
fn killed_by_sigpipe(_status: &ExitStatus) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandLine {
        CommandLine::new(["sh", "-c", script])
    }

    #[test]
    fn bytes_flow_from_producer_to_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        fs::write(&input, b"hello pipeline").unwrap();

        let producer = CommandLine::new(["cat"]).arg(input.to_string_lossy());
        let consumer = sh(&format!("cat > '{}'", output.display()));
        run_pipeline(&producer, &consumer).unwrap();
        assert_eq!(fs::read(output).unwrap(), b"hello pipeline");
    }

    #[test]
    fn consumer_failure_carries_exit_code() {
        let err = run_pipeline(&sh("echo data"), &sh("cat >/dev/null; exit 3")).unwrap_err();
        match err {
            FerryError::Pipeline { command, code } => {
                assert_eq!(code, Some(3));
                assert!(command.contains("exit 3"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn early_consumer_exit_breaks_the_pipe() {
        // `yes` would write forever if the pipe stayed open
        let start = Instant::now();
        run_pipeline(&CommandLine::new(["yes"]), &CommandLine::new(["head", "-n", "1"])).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn producer_failure_is_reported() {
        let err = run_pipeline(&sh("echo partial; exit 2"), &sh("cat >/dev/null")).unwrap_err();
        assert!(matches!(err, FerryError::Pipeline { code: Some(2), .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_pipeline(
            &CommandLine::new(["echo", "x"]),
            &CommandLine::new(["/nonexistent/ferry-consumer"]),
        )
        .unwrap_err();
        assert!(matches!(err, FerryError::Spawn { .. }));
    }

    #[test]
    fn templates_expand_placeholders() {
        let template: Vec<String> = ["split", "-b", "{part_size}", "-", "{output_dir}/"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let vars = Placeholders::new()
            .with("part_size", "1024")
            .with_path("output_dir", Path::new("/w/f.dat"));
        let line = CommandLine::from_template(&template, &vars);
        assert_eq!(line.argv(), &["split", "-b", "1024", "-", "/w/f.dat/"]);
        assert_eq!(line.to_string(), "split -b 1024 - /w/f.dat/");
    }
}
