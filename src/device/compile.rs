use std::fs;
use std::io::{self, Write as _};
use std::process::Command;

use crate::prelude::*;
use crate::types::DeviceConfig;

#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("{0}")]
    IO(#[from] io::Error),

    #[error("compilation failed ({cmd}): {stderr}")]
    CompilationFailed {
        cmd: String,
        stdout: String,
        stderr: String,
    },
}

/// Compiles kernel source text into a cubin image by invoking nvcc.
#[derive(Clone, Debug)]
pub(crate) struct KernelCompiler {
    command: std::path::PathBuf,
    options: Vec<String>,
}

impl KernelCompiler {
    pub(crate) fn new(config: &DeviceConfig) -> Self {
        Self {
            command: config.nvcc.clone(),
            options: config.nvcc_options.clone(),
        }
    }

    /// Returns the null-terminated cubin image for the given compute capability.
    pub(crate) fn compile(
        &self,
        source: &str,
        capability: (i32, i32),
    ) -> Result<Vec<u8>, CompilationError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.options);
        cmd.arg(format!(
            "--gpu-architecture=sm_{}{}",
            capability.0, capability.1
        ));
        cmd.args(&["--define-macro", "NDEBUG=1"]);

        let mut input_file = tempfile::Builder::new()
            .prefix("parskel_")
            .suffix(".cu")
            .tempfile()?;

        input_file.write_all(source.as_bytes())?;
        input_file.flush()?;
        cmd.arg(input_file.path());

        let output_file = tempfile::Builder::new()
            .prefix("parskel_")
            .suffix(".cubin")
            .tempfile()?;

        if !any(&self.options, |p| p.starts_with("-std") || p.starts_with("--std")) {
            cmd.arg("-std=c++14");
        }

        cmd.arg("--cubin");
        cmd.arg("--output-file");
        cmd.arg(output_file.path());

        let result = cmd.output()?;
        let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&result.stdout).into_owned();

        if !result.status.success() {
            return Err(CompilationError::CompilationFailed {
                cmd: format!("{:?}", cmd),
                stdout,
                stderr,
            });
        }

        if !stderr.is_empty() {
            debug!("{:?}: {}", cmd, stderr);
        }

        // nvcc may replace the file instead of writing to it, so read it back by path.
        let mut image = fs::read(output_file.path())?;
        image.push(0);

        Ok(image)
    }
}
