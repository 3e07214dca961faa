/// Core error type for the relay.
///
/// Adapter crates should map their specific errors into this type so the
/// dispatcher can handle failures consistently (user-facing reply vs
/// operational fault).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("send failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_render_their_context() {
        let send = Error::Send("broken pipe".to_string());
        assert_eq!(send.to_string(), "send failed: broken pipe");

        let ledger = Error::Ledger("warrants.json: bad document".to_string());
        assert_eq!(ledger.to_string(), "ledger error: warrants.json: bad document");
    }
}
