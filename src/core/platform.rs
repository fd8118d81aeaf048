use std::path::{Path, PathBuf};

/// Per-platform adapter. Only activation layout and path syntax differ
/// between operating systems; the sequence itself is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Unix => "unix",
            Platform::Windows => "windows",
        }
    }

    /// Directory inside an environment that holds its executables.
    pub fn bin_dir_name(&self) -> &'static str {
        match self {
            Platform::Unix => "bin",
            Platform::Windows => "Scripts",
        }
    }

    pub fn exe_suffix(&self) -> &'static str {
        match self {
            Platform::Unix => "",
            Platform::Windows => ".exe",
        }
    }

    pub fn path_list_separator(&self) -> char {
        match self {
            Platform::Unix => ':',
            Platform::Windows => ';',
        }
    }

    pub fn env_bin_dir(&self, env_dir: &Path) -> PathBuf {
        env_dir.join(self.bin_dir_name())
    }

    /// Rewrites `/` and `\` separators in a plan path to this platform's syntax.
    pub fn native_path(&self, raw: &str) -> PathBuf {
        let normalized = match self {
            Platform::Unix => raw.replace('\\', "/"),
            Platform::Windows => raw.replace('/', "\\"),
        };
        PathBuf::from(normalized)
    }

    /// Prepends `dir` to an existing PATH value.
    pub fn prepend_search_path(&self, dir: &Path, existing: Option<&str>) -> String {
        match existing {
            Some(rest) if !rest.is_empty() => {
                format!("{}{}{}", dir.display(), self.path_list_separator(), rest)
            }
            _ => dir.display().to_string(),
        }
    }

    /// Looks for `program` inside an activated bin directory.
    pub fn resolve_in(&self, bin_dir: &Path, program: &str) -> Option<PathBuf> {
        if program.contains('/') || program.contains('\\') {
            return None;
        }
        let mut candidates = vec![bin_dir.join(program)];
        if !self.exe_suffix().is_empty() && !program.ends_with(self.exe_suffix()) {
            candidates.push(bin_dir.join(format!("{}{}", program, self.exe_suffix())));
        }
        candidates.into_iter().find(|c| c.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_dir_per_platform() {
        let env = Path::new("venv");
        assert_eq!(Platform::Unix.env_bin_dir(env), PathBuf::from("venv").join("bin"));
        assert_eq!(
            Platform::Windows.env_bin_dir(env),
            PathBuf::from("venv").join("Scripts")
        );
    }

    #[test]
    fn test_prepend_search_path() {
        let dir = Path::new("/opt/env/bin");
        assert_eq!(
            Platform::Unix.prepend_search_path(dir, Some("/usr/bin")),
            "/opt/env/bin:/usr/bin"
        );
        assert_eq!(Platform::Unix.prepend_search_path(dir, None), "/opt/env/bin");
        assert!(Platform::Windows
            .prepend_search_path(dir, Some("C:\\Windows"))
            .contains(';'));
    }

    #[test]
    fn test_native_path() {
        assert_eq!(
            Platform::Unix.native_path("fixtures\\sample_data.json"),
            PathBuf::from("fixtures/sample_data.json")
        );
        assert_eq!(
            Platform::Windows.native_path("fixtures/sample_data.json"),
            PathBuf::from("fixtures\\sample_data.json")
        );
    }

    #[test]
    fn test_resolve_in_bin_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("pip"), b"").unwrap();

        assert_eq!(
            Platform::Unix.resolve_in(dir.path(), "pip"),
            Some(dir.path().join("pip"))
        );
        assert_eq!(Platform::Unix.resolve_in(dir.path(), "python"), None);
        assert_eq!(Platform::Unix.resolve_in(dir.path(), "./pip"), None);
    }
}
