//! Invocation of the external high-level language compiler.
//!
//! The structured-text/ladder compiler is an opaque executable: it is
//! invoked by filename, either produces a module file or exits non-zero.
//! Scenarios use it as an alternative source of module bytes next to the
//! built-in assembler.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use thiserror::Error;

/// External compiler failure.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to run compiler {compiler:?}: {source}")]
    Spawn {
        compiler: PathBuf,
        source: std::io::Error,
    },

    #[error("compiler exited with {status} for {input:?}")]
    Failed { input: PathBuf, status: ExitStatus },

    #[error("compiler produced no readable output at {output:?}: {source}")]
    Output {
        output: PathBuf,
        source: std::io::Error,
    },
}

/// Compile a high-level source file into module bytes.
///
/// Runs `<compiler> <source> -o <source-with-.plcm>` and reads the result
/// back. The compiler's internals are none of our business; a non-zero
/// exit code is the entire failure contract.
pub fn compile_source(compiler: &Path, source: &Path) -> Result<Vec<u8>, CompileError> {
    let output = source.with_extension("plcm");

    log::debug!(
        "compiling {} -> {}",
        source.display(),
        output.display()
    );
    let status = Command::new(compiler)
        .arg(source)
        .arg("-o")
        .arg(&output)
        .status()
        .map_err(|source| CompileError::Spawn {
            compiler: compiler.to_path_buf(),
            source,
        })?;

    if !status.success() {
        return Err(CompileError::Failed {
            input: source.to_path_buf(),
            status,
        });
    }

    std::fs::read(&output).map_err(|source| CompileError::Output { output, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_compiler_is_spawn_error() {
        let err = compile_source(
            Path::new("/nonexistent/plc-compiler"),
            Path::new("/tmp/prog.st"),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Spawn { .. }));
    }
}
