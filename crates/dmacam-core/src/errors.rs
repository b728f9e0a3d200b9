use std::path::PathBuf;

use thiserror::Error;

use crate::types::{BufferIndex, BufferState, FourCc};

#[derive(Error, Debug)]
pub enum DmacamError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Device setup failed: {0}")]
    Device(#[from] DeviceError),

    #[error("Format negotiation failed: {0}")]
    Format(#[from] FormatError),

    #[error("Buffer allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Buffer export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Streaming failed: {0}")]
    Stream(#[from] StreamError),

    #[error("Image import failed: {0}")]
    Import(#[from] ImportError),

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot open '{}': {source}", path.display())]
    Open { path: PathBuf, source: std::io::Error },

    #[error("'{}' is not a character device", path.display())]
    NotCharacterDevice { path: PathBuf },

    #[error("VIDIOC_QUERYCAP failed (not a V4L2 device?): {source}")]
    Query { source: std::io::Error },

    #[error("'{card}' lacks {missing} support")]
    Unsupported { card: String, missing: &'static str },
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("pixel format {fourcc} has no GPU import mapping")]
    Unsupported { fourcc: FourCc },

    #[error("VIDIOC_S_FMT failed: {source}")]
    Set { source: std::io::Error },

    #[error("VIDIOC_G_FMT failed: {source}")]
    Get { source: std::io::Error },

    #[error("driver granted pixel format {granted} instead of {requested}")]
    Mismatch { requested: FourCc, granted: FourCc },

    #[error("driver granted an unusable format: {reason}")]
    Degenerate { reason: String },
}

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("video capture or MMAP streaming is not supported: {source}")]
    StreamingUnsupported { source: std::io::Error },

    #[error("VIDIOC_REQBUFS({count}) failed: {source}")]
    Request { count: u32, source: std::io::Error },

    #[error("driver granted zero buffers (requested {requested})")]
    NoBuffers { requested: u32 },

    #[error("VIDIOC_QUERYBUF for buffer {index} failed: {source}")]
    Query { index: BufferIndex, source: std::io::Error },

    #[error("buffer {index} holds {length} bytes but the granted format needs {required}")]
    BufferTooSmall { index: BufferIndex, length: u32, required: u64 },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("VIDIOC_EXPBUF for buffer {index} failed: {source}")]
    Export { index: BufferIndex, source: std::io::Error },

    #[error("buffer {index} is not part of the pool")]
    UnknownBuffer { index: BufferIndex },
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("VIDIOC_STREAMON failed: {source}")]
    StreamOn { source: std::io::Error },

    #[error("VIDIOC_STREAMOFF failed: {source}")]
    StreamOff { source: std::io::Error },

    #[error("VIDIOC_QBUF for buffer {index} failed: {source}")]
    Queue { index: BufferIndex, source: std::io::Error },

    #[error("VIDIOC_DQBUF failed: {source}")]
    Dequeue { source: std::io::Error },

    #[error("buffer {index} cannot go from {from} to {to}")]
    InvalidTransition { index: BufferIndex, from: BufferState, to: BufferState },

    #[error("buffer {index} is not part of the pool")]
    UnknownBuffer { index: BufferIndex },

    #[error("buffer {index} has no exported handle")]
    NotExported { index: BufferIndex },

    #[error("streaming is not active")]
    NotStreaming,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("libEGL could not be loaded: {0}")]
    EglUnavailable(String),

    #[error("no current EGL display")]
    NoDisplay,

    #[error("EGL extension {0} not available")]
    MissingExtension(&'static str),

    #[error("entry point {0} not available")]
    MissingEntryPoint(&'static str),

    #[error("eglCreateImageKHR rejected {fourcc} {width}x{height}: {reason}")]
    CreateImage { fourcc: FourCc, width: u32, height: u32, reason: String },

    #[error("texture allocation failed: {0}")]
    Texture(String),

    #[error("binding buffer {index} as external texture failed: GL error 0x{code:04x}")]
    Bind { index: BufferIndex, code: u32 },
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("shader compilation failed: {0}")]
    Shader(String),

    #[error("program link failed: {0}")]
    Link(String),

    #[error("GL resource allocation failed: {0}")]
    Resource(String),

    #[error("fence creation failed: {0}")]
    Fence(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_names_both_encodings() {
        let err: DmacamError = FormatError::Mismatch {
            requested: FourCc::new(b"RX24"),
            granted: FourCc::new(b"YUYV"),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.starts_with("Format negotiation failed"), "{msg}");
        assert!(msg.contains("YUYV") && msg.contains("RX24"), "{msg}");
    }

    #[test]
    fn transition_message_names_states() {
        let err = StreamError::InvalidTransition {
            index: BufferIndex(2),
            from: BufferState::Queued,
            to: BufferState::Queued,
        };
        assert_eq!(err.to_string(), "buffer #2 cannot go from queued to queued");
    }
}
