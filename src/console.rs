/// User-facing output: the verbosity level plus redirectable output and error sinks.
use std::io::Write;

pub struct Console {
    verbosity: i8,
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

impl Console {
    pub fn new(verbosity: i8, out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
        Self { verbosity, out, err }
    }

    /// Console writing to the process's stdout and stderr.
    pub fn stdio(verbosity: i8) -> Self {
        Self::new(
            verbosity,
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
        )
    }

    /// Write a line to the output sink when verbosity is at least `level`.
    pub fn say(&mut self, level: i8, message: std::fmt::Arguments<'_>) {
        if self.verbosity < level {
            return;
        }
        if writeln!(self.out, "{message}").is_err() || self.out.flush().is_err() {
            tracing::debug!("failed to write to output sink");
        }
    }

    /// Write a line to the error sink unless the console is silenced.
    pub fn complain(&mut self, message: std::fmt::Arguments<'_>) {
        if self.verbosity < 0 {
            return;
        }
        // keep ordering sane when both sinks share a terminal
        let _ = self.out.flush();
        if writeln!(self.err, "{message}").is_err() {
            tracing::debug!("failed to write to error sink");
        }
    }
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
