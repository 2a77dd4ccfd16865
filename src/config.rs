use std::path::PathBuf;

/// Resolved command-line configuration. Built once by the CLI and
/// handed to the server; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Absolute path of the directory being served.
    pub root_dir: PathBuf,
    /// Port to listen on; 0 asks the OS for any free port.
    pub port: u16,
    /// Launch the default browser at the root URL after startup.
    pub open_browser: bool,
    pub tuning: Tuning,
}

/// Compiled-in server tuning. There is no configuration file; these
/// defaults are the only deployment profile.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub workers: usize,
    pub queue_size: usize,
    pub connection_buffer_size: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            workers: 32,
            queue_size: 2000,
            connection_buffer_size: 65536,
            read_timeout_secs: 10,
            write_timeout_secs: 15,
        }
    }
}

impl ServeConfig {
    pub fn new(root_dir: PathBuf, port: u16, open_browser: bool) -> Self {
        Self {
            root_dir,
            port,
            open_browser,
            tuning: Tuning::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_defaults_are_sane() {
        let t = Tuning::default();
        assert!(t.workers > 0);
        assert!(t.queue_size >= t.workers);
        assert!(t.connection_buffer_size >= 8192);
    }
}
