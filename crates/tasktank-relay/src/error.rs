use thiserror::Error;

use tasktank_shared::error::RecordError;

/// Why a client frame was refused. The display text is what the client sees
/// in the `OK` or `NOTICE` reply, prefixed the way relay clients expect.
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("invalid: {0}")]
    Invalid(#[from] RecordError),

    #[error("rejected: record too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("rejected: too many subscriptions (max {0})")]
    TooManySubscriptions(usize),

    #[error("error: could not parse frame: {0}")]
    BadFrame(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_prefix() {
        let e = RelayServerError::from(RecordError::BadSignature);
        assert!(e.to_string().starts_with("invalid: "));
        let e = RelayServerError::TooLarge { size: 10, max: 5 };
        assert!(e.to_string().starts_with("rejected: "));
    }
}
