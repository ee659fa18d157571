use codegen::CompileError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("no exported function named '{0}'")]
    ExportNotFound(String),
    #[error("argument count or types do not match the export's signature")]
    SignatureMismatch,
}
