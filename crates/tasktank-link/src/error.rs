use tasktank_shared::error::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Failed to seal signal: {0}")]
    Signal(#[from] CryptoError),
}

impl From<webrtc::Error> for LinkError {
    fn from(e: webrtc::Error) -> Self {
        LinkError::WebRtc(e.to_string())
    }
}
