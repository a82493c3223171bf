use std::path::PathBuf;

/// Errors that stop the translator from starting or reloading.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read configuration file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("include nesting deeper than {limit} levels at {path}")]
    IncludeDepthExceeded { path: PathBuf, limit: usize },

    #[error("route operation failed: {0}")]
    Route(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_config_read() {
        let err = Error::ConfigRead {
            path: PathBuf::from("/etc/map646.conf"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(
            err.to_string(),
            "cannot read configuration file /etc/map646.conf: not found"
        );
    }

    #[test]
    fn error_display_include_depth() {
        let err = Error::IncludeDepthExceeded {
            path: PathBuf::from("loop.conf"),
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "include nesting deeper than 10 levels at loop.conf"
        );
    }

    #[test]
    fn error_display_route() {
        let err = Error::Route("ip -6 route replace 64:ff9b::/96 failed".to_string());
        assert_eq!(
            err.to_string(),
            "route operation failed: ip -6 route replace 64:ff9b::/96 failed"
        );
    }
}
