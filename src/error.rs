use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by the extender library.
///
/// Code edits through [`crate::CodeStream`] never produce one of these: an
/// out-of-bounds edit is simply refused.
#[derive(Error, Debug)]
pub enum Error {
    /// The loader could not redirect the function at this address.
    #[error("Failed to intercept function at {0:#x}")]
    InterceptFailed(usize),

    /// The loader and the plugin don't speak the same interface version.
    #[error("Unsupported interface version {version} (minimum {min_version})")]
    VersionMismatch { version: u32, min_version: u32 },

    /// A module's installers have already been applied.
    #[error("Module {0} is already installed")]
    AlreadyInstalled(&'static str),

    #[error("{} is missing", .0.display())]
    MissingDirectory(PathBuf),

    /// A plugin library could not be opened.
    #[error("{} is invalid", path.display())]
    InvalidLibrary {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("{0} does not export PluginMain")]
    MissingEntryPoint(String),

    /// A plugin's `PluginMain` reported failure.
    #[error("{name}: {reason}")]
    PluginFailed { name: String, reason: String },

    /// One or more plugins failed to load; one line per failure.
    #[error("{}", format_lines(.0))]
    PluginsFailed(Vec<String>),

    /// The running executable is not the build the address tables describe.
    #[error("This version of the game is not supported")]
    UnsupportedGame,

    #[error("{0}")]
    Library(#[from] libloading::Error),

    #[error("{0}")]
    Memory(#[from] region::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

fn format_lines(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| format!("- {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_failures_are_listed() {
        let err = Error::PluginsFailed(vec![
            "Foo: Unknown error".to_string(),
            "plugins/Bar.dll is invalid".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "- Foo: Unknown error\n- plugins/Bar.dll is invalid"
        );
    }
}
