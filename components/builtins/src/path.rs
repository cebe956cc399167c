//! Path module methods

use std::path::Path;

/// Path module: filesystem path inspection
pub struct PathLib;

impl PathLib {
    /// Path.exists(path)
    pub fn exists(path: &str) -> bool {
        Path::new(path).exists()
    }

    /// Path.isDir(path)
    pub fn is_dir(path: &str) -> bool {
        Path::new(path).is_dir()
    }

    /// Path.basename(path)
    pub fn basename(path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path.dirname(path)
    pub fn dirname(path: &str) -> String {
        Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path.extname(path) - extension including the dot, or ""
    pub fn extname(path: &str) -> String {
        Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename_dirname() {
        assert_eq!(PathLib::basename("/tmp/test.du"), "test.du");
        assert_eq!(PathLib::dirname("/tmp/test.du"), "/tmp");
    }

    #[test]
    fn test_extname() {
        assert_eq!(PathLib::extname("script.du"), ".du");
        assert_eq!(PathLib::extname("no_extension"), "");
    }
}
