use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("generator error: {0}")]
    Generator(String),
    #[error("monitor error: {0}")]
    Monitor(String),
    #[error("report error: {0}")]
    Report(String),
    #[error("observer error: {0}")]
    Observer(String),
    #[error("illegal campaign transition: {0}")]
    Phase(String),
}
