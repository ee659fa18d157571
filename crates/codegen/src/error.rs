use module::DecodeError;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("unsupported construct: {0}")]
    Unsupported(&'static str),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
}
