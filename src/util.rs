//! Small helpers shared across modules.

use std::ffi::OsString;
use std::path::PathBuf;

/// Expand a leading `~` to `$HOME` in a user-supplied path.
///
/// - `"~"` → `"/home/user"`
/// - `"~/mail.toml"` → `"/home/user/mail.toml"`
/// - Anything else (including `~other/...`) is returned as is.
pub fn expand_tilde(path: &str) -> PathBuf {
    expand_with_home(path, std::env::var_os("HOME"))
}

fn expand_with_home(path: &str, home: Option<OsString>) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return PathBuf::from(path),
    };
    match home {
        Some(home) => {
            let mut expanded = PathBuf::from(home);
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() {
                expanded.push(rest);
            }
            expanded
        }
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> Option<OsString> {
        Some(OsString::from("/home/ada"))
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_with_home("~", home()), PathBuf::from("/home/ada"));
        assert_eq!(
            expand_with_home("~/mailxfer.toml", home()),
            PathBuf::from("/home/ada/mailxfer.toml")
        );
        assert_eq!(
            expand_with_home("~bob/x.toml", home()),
            PathBuf::from("~bob/x.toml")
        );
        assert_eq!(
            expand_with_home("/etc/mailxfer.toml", home()),
            PathBuf::from("/etc/mailxfer.toml")
        );
        assert_eq!(expand_with_home("~/x", None), PathBuf::from("~/x"));
    }
}
