use std::path::{Path, PathBuf};

const DEFAULT_HOME_DIR_NAME: &str = ".tessera";
const CONFIG_FILE_NAME: &str = "tessera.toml";
const LOG_DIR_NAME: &str = "logs";
const DEFAULT_LOG_FILE: &str = "tessera.log";

/// Every filesystem location the CLI touches, resolved once per invocation.
///
/// `--conf-dir` picks the home directory; the config file and log directory
/// live under it. Paths typed by the user (`--tools`, `--replay`) go through
/// [`TesseraPaths::user_input`], while paths read from `tessera.toml`
/// go through [`TesseraPaths::log_file`] and are anchored at home instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesseraPaths {
    home: PathBuf,
    user_home: Option<PathBuf>,
    cwd: PathBuf,
}

impl TesseraPaths {
    pub fn resolve(conf_dir: Option<&Path>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::resolve_with(conf_dir, user_home_from_env(), cwd)
    }

    /// Resolution with the user's home directory and working directory supplied.
    pub fn resolve_with(conf_dir: Option<&Path>, user_home: Option<PathBuf>, cwd: PathBuf) -> Self {
        let mut paths = Self {
            home: PathBuf::new(),
            user_home,
            cwd,
        };
        paths.home = match conf_dir {
            Some(dir) => paths.user_input(dir),
            None => paths.fallback_user_home().join(DEFAULT_HOME_DIR_NAME),
        };
        paths
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join(CONFIG_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join(LOG_DIR_NAME)
    }

    /// Directories `config init` creates.
    pub fn init_directories(&self) -> Vec<PathBuf> {
        vec![self.home.clone(), self.log_dir()]
    }

    /// Log file for a `[log].path` value. Relative values sit under home.
    pub fn log_file(&self, configured: Option<&str>) -> PathBuf {
        match configured.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => {
                let expanded = self.expand_tilde(Path::new(raw));
                if expanded.is_absolute() {
                    expanded
                } else {
                    self.home.join(expanded)
                }
            }
            None => self.log_dir().join(DEFAULT_LOG_FILE),
        }
    }

    /// A path given on the command line. Relative values sit under the cwd.
    pub fn user_input(&self, path: &Path) -> PathBuf {
        let expanded = self.expand_tilde(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.cwd.join(expanded)
        }
    }

    fn expand_tilde(&self, path: &Path) -> PathBuf {
        let raw = path.to_string_lossy();
        if raw == "~" {
            return self.fallback_user_home();
        }
        match raw.strip_prefix("~/") {
            Some(suffix) => self.fallback_user_home().join(suffix),
            None => path.to_path_buf(),
        }
    }

    fn fallback_user_home(&self) -> PathBuf {
        self.user_home.clone().unwrap_or_else(|| self.cwd.clone())
    }
}

fn user_home_from_env() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
